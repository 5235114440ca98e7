/// Periodic store maintenance.
///
/// Runs on a fixed period and is the sole mechanism bounding memory
/// growth: expired blocks, decayed scores, stale fingerprints and dead
/// rate buckets are all shed here. The sweep takes the same store locks
/// as the request path; it gets no special treatment.
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::JanitorConfig;
use crate::store::{SweepStats, ThreatStore};

pub struct Janitor {
    store: Arc<ThreatStore>,
    config: JanitorConfig,
}

impl Janitor {
    pub fn new(store: Arc<ThreatStore>, config: JanitorConfig) -> Self {
        Self { store, config }
    }

    /// One maintenance pass, callable directly from tests and from the
    /// admin API.
    pub fn sweep_once(&self) -> SweepStats {
        let stats = self.store.sweep(
            self.config.decay_step,
            self.config.fingerprint_ttl_secs * 1_000,
            self.config.bucket_grace_secs * 1_000,
        );

        if stats == SweepStats::default() {
            debug!("janitor sweep: nothing to do");
        } else {
            info!(
                "janitor sweep: {} expired blocks, {} decayed, {} records removed, {} fingerprints, {} buckets",
                stats.expired_blocks,
                stats.decayed_records,
                stats.removed_records,
                stats.stale_fingerprints,
                stats.stale_buckets
            );
        }
        stats
    }

    /// Spawn the periodic sweep task. Aborting the handle stops it.
    pub fn spawn(self) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.period_secs);
        info!("starting janitor (period: {:?})", period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately; skip it so a fresh store
            // is not swept at startup.
            interval.tick().await;

            loop {
                interval.tick().await;
                self.sweep_once();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use crate::clock::ManualClock;

    fn test_janitor() -> (Arc<ManualClock>, Arc<ThreatStore>, Janitor) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let audit = Arc::new(AuditSink::in_memory(clock.clone(), 100));
        let store = Arc::new(ThreatStore::new(clock.clone(), audit));
        let janitor = Janitor::new(store.clone(), JanitorConfig::default());
        (clock, store, janitor)
    }

    #[test]
    fn test_decay_to_zero_removes_record() {
        let (_clock, store, janitor) = test_janitor();

        store.add_suspicion("a", 5, "probe");
        let stats = janitor.sweep_once();
        assert_eq!(stats.decayed_records, 1);
        assert_eq!(stats.removed_records, 1);
        assert_eq!(store.suspicion_score("a"), 0);
        let (clients, _, _) = store.sizes();
        assert_eq!(clients, 0);

        // Idempotent: sweeping the absent record again is a no-op.
        let stats = janitor.sweep_once();
        assert_eq!(stats, SweepStats::default());
    }

    #[test]
    fn test_trusted_records_never_decay() {
        let (_clock, store, janitor) = test_janitor();
        store.trust("vip");

        let stats = janitor.sweep_once();
        assert_eq!(stats.decayed_records, 0);
        assert!(store.is_trusted("vip"));
    }

    #[test]
    fn test_expired_block_swept() {
        let (clock, store, janitor) = test_janitor();
        store.mark_blocked("b", 10, "short");

        clock.advance_ms(11_000);
        let stats = janitor.sweep_once();
        assert_eq!(stats.expired_blocks, 1);
        assert!(!store.is_blocked("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_task_sweeps_on_period() {
        let (_clock, store, janitor) = test_janitor();
        store.add_suspicion("a", 25, "probe");

        let handle = janitor.spawn();

        // Advance past one janitor period (5 minutes) under the paused
        // tokio clock; the sweep should have decayed the score by 10.
        tokio::time::sleep(Duration::from_secs(301)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.suspicion_score("a"), 15);

        handle.abort();
    }
}
