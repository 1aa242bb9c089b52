use clap::{Parser, Subcommand};
use relay::config::AppConfig;
use relay::dispatcher::Dispatcher;
use relay::error::RelayError;
use relay::membership::MembershipFilter;
use relay::metrics::Metrics;
use relay::node::Node;
use relay::processor::{DirectPublish, Processor};
use relay::store::Store;
use relay::validator::ValidatorConfig;
use relay::ws::WsState;
use relay::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay", version, about = "A gossip-style event relay")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Boot the Node and serve WebSocket/HTTP traffic until shutdown.
    Start {
        /// Path to a YAML config file. Falls back to defaults and SHUGUR_* env vars.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config_path = match args.command {
        Some(Command::Start { config }) | None => config,
    };

    if let Err(err) = run(config_path.as_deref()).await {
        tracing::error!(error = %err, "relay exited with a fatal error");
        std::process::exit(1);
    }
}

async fn run(config_path: Option<&str>) -> Result<(), RelayError> {
    let config = AppConfig::load(config_path).map_err(RelayError::Config)?;
    init_tracing(&config);

    info!("connecting to database...");
    let store = Arc::new(Store::connect(&config.database.connection_string(), config.database.pool_size).await?);
    store.run_migrations().await?;
    info!("migrations applied");

    let membership = Arc::new(MembershipFilter::new());
    let ids = store.all_ids().await?;
    membership.rebuild(ids);
    info!("membership filter rebuilt");

    let metrics = Arc::new(Metrics::new());
    let node = Node::new(store.clone(), membership.clone(), metrics.clone());

    let dispatcher = Dispatcher::new(node.clone(), store.clone());
    let dispatcher_handle = dispatcher.start(&config.database.connection_string()).await?;

    let processor = Arc::new(Processor::spawn(
        config.relay.event_cache_size,
        num_cpus(),
        store.clone(),
        membership.clone(),
        metrics.clone(),
        dispatcher.clone() as Arc<dyn DirectPublish>,
    ));

    let sweeper = node.bans.spawn_sweeper();
    let resync = spawn_events_stored_resync(store.clone(), metrics.clone());

    let ws_state = WsState {
        node: node.clone(),
        processor,
        store: store.clone(),
        validator_config: Arc::new(ValidatorConfig::default()),
        relay_config: Arc::new(config.relay.clone()),
    };
    let app_state = AppState { ws: ws_state, metrics: metrics.clone(), store: store.clone() };
    let router = relay::build_router(app_state, &config.relay.ws_addr, &config.metrics.path)
        .layer(TraceLayer::new_for_http());

    let bind_addr = format!("{}:{}", config.general.address, config.general.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| RelayError::Init(format!("failed to bind {bind_addr}: {e}")))?;
    info!(addr = %bind_addr, "relay listening");

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| RelayError::Init(format!("server error: {e}")))?;

    info!("stopping cdc dispatcher");
    dispatcher_handle.stop().await;
    sweeper.abort();
    resync.abort();

    info!("closing store pool");
    store.pool().close().await;
    info!("relay shut down gracefully");
    Ok(())
}

/// Keeps the `events_stored` gauge close to the true row count. Replaceable,
/// addressable, and deletion writes change row count by more than the
/// insert/duplicate outcome alone reveals, so this polls the source of
/// truth instead of trying to track the delta at every write site.
fn spawn_events_stored_resync(store: Arc<Store>, metrics: Arc<Metrics>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            match store.total_event_count().await {
                Ok(n) => metrics.events_stored.set(n),
                Err(e) => tracing::warn!(error = %e, "failed to resync events_stored gauge"),
            }
        }
    })
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match &config.logging.level {
            relay::config::LogLevel::Debug => "debug",
            relay::config::LogLevel::Info => "info",
            relay::config::LogLevel::Warn => "warn",
            relay::config::LogLevel::Error | relay::config::LogLevel::Fatal => "error",
        })
    });
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match &config.logging.format {
        relay::config::LogFormat::Json => subscriber.json().init(),
        relay::config::LogFormat::Console => subscriber.init(),
    }
}

/// Worker pool size for the Processor: twice the available parallelism,
/// floored at 1 for single-core environments.
fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get() * 2).unwrap_or(2)
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
