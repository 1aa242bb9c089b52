// Layered configuration: embedded defaults -> optional YAML file -> env vars
// prefixed SHUGUR_ with `.` -> `_` in names, following the `config` crate
// usage the teacher's server also leans on for its own env-driven settings.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub address: String,
    pub port: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_owned(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Console,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Carried for schema round-tripping only; rotation is not implemented —
    /// log file writing is an external collaborator (§1).
    pub file: Option<String>,
    pub max_size_mb: u32,
    pub max_backups: u32,
    pub max_age_days: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Console,
            file: None,
            max_size_mb: 100,
            max_backups: 3,
            max_age_days: 28,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_events_per_second: u32,
    pub max_requests_per_second: u32,
    pub burst_size: u32,
    pub progressive_ban: bool,
    pub ban_duration_secs: u64,
    pub max_ban_duration_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_events_per_second: 50,
            max_requests_per_second: 50,
            burst_size: 10,
            progressive_ban: false,
            ban_duration_secs: 600,
            max_ban_duration_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThrottlingConfig {
    pub max_content_length: usize,
    pub max_connections: usize,
    pub ban_threshold: u32,
    pub ban_duration_secs: u64,
    pub rate_limit: RateLimitConfig,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            max_content_length: 64 * 1024,
            max_connections: 10_000,
            ban_threshold: 3,
            ban_duration_secs: 600,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub name: String,
    pub description: String,
    pub contact: String,
    pub ws_addr: String,
    pub idle_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub send_buffer_size: usize,
    pub event_cache_size: usize,
    pub shutdown_timeout_secs: u64,
    pub throttling: ThrottlingConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: "relay".to_owned(),
            description: String::new(),
            contact: String::new(),
            ws_addr: "/ws".to_owned(),
            idle_timeout_secs: 120,
            write_timeout_secs: 10,
            send_buffer_size: 1024,
            event_cache_size: 4096,
            shutdown_timeout_secs: 10,
            throttling: ThrottlingConfig::default(),
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub server: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_owned(),
            port: 5432,
            name: "relay".to_owned(),
            user: "postgres".to_owned(),
            password: String::new(),
            pool_size: 10,
        }
    }
}

impl DatabaseConfig {
    #[must_use]
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.server, self.port, self.name
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: 9090,
            path: "/metrics".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
    pub database: DatabaseConfig,
    pub metrics: MetricsConfig,
}

impl AppConfig {
    /// Load defaults, then merge an optional YAML file, then environment
    /// variables prefixed `SHUGUR_` (`.` in a key becomes `_`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let defaults = config::Config::try_from(&Self::default())?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SHUGUR")
                .separator("_")
                .try_parsing(true),
        );
        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_file_or_env() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.general.port, 8080);
        assert_eq!(cfg.relay.throttling.ban_threshold, 3);
        assert_eq!(cfg.database.connection_string(), "postgres://postgres:@127.0.0.1:5432/relay");
    }

    #[test]
    fn env_override_replaces_a_nested_value() {
        std::env::set_var("SHUGUR_GENERAL_PORT", "4000");
        let cfg = AppConfig::load(None).expect("config should load");
        assert_eq!(cfg.general.port, 4000);
        std::env::remove_var("SHUGUR_GENERAL_PORT");
    }
}
