// Per-session token buckets and the process-wide Ban Registry (spec.md
// §4.6). Token buckets are built on `governor`, grounded on the
// subscription-rate-limit usage in the `kofj-nostr-rs-relay` reference
// example's Cargo manifest.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

fn quota(rate_per_second: u32, burst: u32) -> Quota {
    let rate = NonZeroU32::new(rate_per_second.max(1)).unwrap();
    let burst = NonZeroU32::new(burst.max(1)).unwrap();
    Quota::per_second(rate).allow_burst(burst)
}

/// The two per-session lanes from spec.md §4.1: inbound `EVENT` frames and
/// outbound advisory frames (`NOTICE`/`OK`/`CLOSED`). Subscription/data
/// frames bypass rate limiting entirely and so have no limiter here.
pub struct SessionLimiter {
    event_lane: DirectLimiter,
    advisory_lane: DirectLimiter,
}

impl SessionLimiter {
    #[must_use]
    pub fn new(max_events_per_second: u32, max_advisory_per_second: u32, burst_size: u32) -> Self {
        Self {
            event_lane: RateLimiter::direct(quota(max_events_per_second, burst_size)),
            advisory_lane: RateLimiter::direct(quota(max_advisory_per_second, burst_size)),
        }
    }

    /// `true` if an inbound EVENT frame may proceed.
    #[must_use]
    pub fn allow_event(&self) -> bool {
        self.event_lane.check().is_ok()
    }

    /// `true` if an outbound advisory frame may be sent.
    #[must_use]
    pub fn allow_advisory(&self) -> bool {
        self.advisory_lane.check().is_ok()
    }
}

/// Process-wide map from remote IP to ban expiry, mutated under a single
/// mutex (spec.md §3, §4.6).
#[derive(Clone)]
pub struct BanRegistry {
    bans: Arc<Mutex<HashMap<IpAddr, Instant>>>,
}

impl BanRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bans: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `true` if `addr` is currently under an unexpired ban.
    pub async fn is_banned(&self, addr: IpAddr) -> bool {
        match self.bans.lock().await.get(&addr) {
            Some(expiry) => *expiry > Instant::now(),
            None => false,
        }
    }

    pub async fn ban(&self, addr: IpAddr, duration: Duration) {
        self.bans.lock().await.insert(addr, Instant::now() + duration);
    }

    /// Remove expired entries. Called by the background sweeper every 10
    /// minutes, and exposed directly for tests.
    pub async fn sweep(&self) {
        let now = Instant::now();
        self.bans.lock().await.retain(|_, expiry| *expiry > now);
    }

    /// Spawn the 10-minute sweep task. The returned handle is aborted on
    /// Node shutdown.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(600));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                registry.sweep().await;
            }
        })
    }
}

impl Default for BanRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn limiter_allows_burst_then_denies() {
        let limiter = SessionLimiter::new(1, 1, 1);
        assert!(limiter.allow_event());
        assert!(!limiter.allow_event());
    }

    #[tokio::test]
    async fn ban_registry_reports_banned_until_expiry_then_clears_on_sweep() {
        let registry = BanRegistry::new();
        let addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        assert!(!registry.is_banned(addr).await);

        registry.ban(addr, Duration::from_millis(20)).await;
        assert!(registry.is_banned(addr).await);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!registry.is_banned(addr).await);

        registry.sweep().await;
        assert!(registry.bans.lock().await.is_empty());
    }
}
