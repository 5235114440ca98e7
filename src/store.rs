/// Shared mutable threat state.
///
/// All per-client tracking lives here: block state, suspicion scores,
/// rate buckets, request fingerprints. One `RwLock` per logical map so
/// rate-bucket traffic never contends with client-record mutation. The
/// janitor and the request path go through the same operations and the
/// same locks.
///
/// Lock poisoning is recovered rather than propagated: a panic in another
/// request task must not take the whole engine down. The recovery is
/// logged at error level because it means a previous panic may have left
/// a record mid-update.
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info};

use crate::audit::{AuditEvent, AuditEventType, AuditSeverity, AuditSink};
use crate::clock::Clock;

/// Cap on per-client activity history entries.
const MAX_RECENT_ACTIVITY: usize = 20;

// =============================================================================
// RECORDS
// =============================================================================

/// Tracked state for one client identity (normally an IP address).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientRecord {
    /// If set and in the future, all non-exempt requests are rejected
    pub blocked_until: Option<u64>,
    pub block_reason: String,
    /// Accumulated violation score, decayed by the janitor
    pub suspicion_score: u32,
    /// Informational trail of recent violations, oldest evicted first
    pub recent_activity: VecDeque<ActivityEntry>,
    /// Trusted clients bypass suspicion scoring and blocking
    pub trusted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub label: String,
    pub timestamp_ms: u64,
}

/// Fixed-window request counter for one (client, endpoint) pair.
#[derive(Debug, Clone)]
pub struct RateBucket {
    pub count: u32,
    /// End of the current window; only ever moves forward
    pub window_reset_at: u64,
}

/// Observation-only request fingerprint. Recorded and TTL-evicted, not
/// consulted in any decision; reserved for future anomaly correlation.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub last_seen: u64,
}

/// Counts removed by one janitor sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub expired_blocks: usize,
    pub decayed_records: usize,
    pub removed_records: usize,
    pub stale_fingerprints: usize,
    pub stale_buckets: usize,
}

/// Admin-facing snapshot of one client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub client: String,
    pub suspicion_score: u32,
    pub trusted: bool,
    pub blocked_until: Option<u64>,
    pub block_reason: Option<String>,
    pub recent_activity: Vec<ActivityEntry>,
}

// =============================================================================
// STORE
// =============================================================================

pub struct ThreatStore {
    clock: Arc<dyn Clock>,
    audit: Arc<AuditSink>,
    clients: RwLock<HashMap<String, ClientRecord>>,
    buckets: RwLock<HashMap<String, RateBucket>>,
    fingerprints: RwLock<HashMap<String, Fingerprint>>,
}

impl ThreatStore {
    pub fn new(clock: Arc<dyn Clock>, audit: Arc<AuditSink>) -> Self {
        Self {
            clock,
            audit,
            clients: RwLock::new(HashMap::new()),
            buckets: RwLock::new(HashMap::new()),
            fingerprints: RwLock::new(HashMap::new()),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn audit(&self) -> &Arc<AuditSink> {
        &self.audit
    }

    // =========================================================================
    // BLOCKING
    // =========================================================================

    /// Block a client for `duration_secs`. Trusted clients cannot be
    /// auto-blocked; trust is revoked first by an explicit admin action.
    pub fn mark_blocked(&self, client: &str, duration_secs: u64, reason: &str) {
        let until = self.clock.now_ms() + duration_secs * 1_000;
        {
            let mut clients = write_or_recover(&self.clients, "client records");
            let record = clients.entry(client.to_string()).or_default();
            if record.trusted {
                debug!("skipping block of trusted client {}", client);
                return;
            }
            record.blocked_until = Some(until);
            record.block_reason = reason.to_string();
        }

        info!("client {} blocked for {}s: {}", client, duration_secs, reason);
        self.audit.record(
            AuditEvent::new(AuditEventType::IpBlocked, AuditSeverity::High, reason)
                .with_client(client)
                .with_context(serde_json::json!({ "duration_secs": duration_secs })),
        );
    }

    /// Whether the client is currently blocked.
    ///
    /// An expired block is cleared on this read, under the write lock, so
    /// no caller ever observes a stale rejection.
    pub fn is_blocked(&self, client: &str) -> bool {
        let now = self.clock.now_ms();

        // Fast path: most clients have no record or no block.
        {
            let clients = read_or_recover(&self.clients, "client records");
            match clients.get(client).and_then(|r| r.blocked_until) {
                None => return false,
                Some(until) if until > now => return true,
                Some(_) => {} // expired, clear below
            }
        }

        let mut clients = write_or_recover(&self.clients, "client records");
        if let Some(record) = clients.get_mut(client) {
            // Re-check under the write lock: another task may have
            // re-blocked or already cleared between the two locks.
            match record.blocked_until {
                Some(until) if until > now => return true,
                Some(_) => {
                    record.blocked_until = None;
                    record.block_reason.clear();
                    debug!("expired block cleared for {}", client);
                }
                None => {}
            }
        }
        false
    }

    /// Remove a block by admin action. Returns false for unknown clients.
    pub fn unblock(&self, client: &str) -> bool {
        let removed = {
            let mut clients = write_or_recover(&self.clients, "client records");
            match clients.get_mut(client) {
                Some(record) if record.blocked_until.is_some() => {
                    record.blocked_until = None;
                    record.block_reason.clear();
                    record.suspicion_score = 0;
                    true
                }
                _ => false,
            }
        };

        if removed {
            info!("client {} unblocked by admin", client);
            self.audit.record(
                AuditEvent::new(
                    AuditEventType::AdminUnblock,
                    AuditSeverity::Info,
                    "block removed by administrator",
                )
                .with_client(client),
            );
        }
        removed
    }

    /// Clear every active block. Returns the number cleared.
    pub fn clear_all_blocks(&self) -> usize {
        let cleared = {
            let mut clients = write_or_recover(&self.clients, "client records");
            let mut cleared = 0;
            for record in clients.values_mut() {
                if record.blocked_until.is_some() {
                    record.blocked_until = None;
                    record.block_reason.clear();
                    cleared += 1;
                }
            }
            cleared
        };

        info!("admin cleared {} active blocks", cleared);
        self.audit.record(
            AuditEvent::new(
                AuditEventType::AdminClearAll,
                AuditSeverity::Info,
                "all blocks cleared by administrator",
            )
            .with_context(serde_json::json!({ "cleared": cleared })),
        );
        cleared
    }

    // =========================================================================
    // TRUST
    // =========================================================================

    /// Mark a client trusted. Idempotent; clears any prior suspicion and
    /// block, so a trusted record never carries a positive score.
    pub fn trust(&self, client: &str) {
        let newly_trusted = {
            let mut clients = write_or_recover(&self.clients, "client records");
            let record = clients.entry(client.to_string()).or_default();
            let newly = !record.trusted;
            record.trusted = true;
            record.suspicion_score = 0;
            record.blocked_until = None;
            record.block_reason.clear();
            newly
        };

        if newly_trusted {
            debug!("client {} trusted", client);
            self.audit.record(
                AuditEvent::new(
                    AuditEventType::ClientTrusted,
                    AuditSeverity::Info,
                    "client presented valid session proof",
                )
                .with_client(client),
            );
        }
    }

    pub fn is_trusted(&self, client: &str) -> bool {
        let clients = read_or_recover(&self.clients, "client records");
        clients.get(client).map(|r| r.trusted).unwrap_or(false)
    }

    // =========================================================================
    // SUSPICION
    // =========================================================================

    /// Add suspicion points and record the violation label in the activity
    /// trail. Returns the new score. No-op returning 0 for trusted clients.
    pub fn add_suspicion(&self, client: &str, points: u32, label: &str) -> u32 {
        let now = self.clock.now_ms();
        let mut clients = write_or_recover(&self.clients, "client records");
        let record = clients.entry(client.to_string()).or_default();
        if record.trusted {
            return 0;
        }

        record.suspicion_score = record.suspicion_score.saturating_add(points);
        if record.recent_activity.len() >= MAX_RECENT_ACTIVITY {
            record.recent_activity.pop_front();
        }
        record.recent_activity.push_back(ActivityEntry {
            label: label.to_string(),
            timestamp_ms: now,
        });
        record.suspicion_score
    }

    pub fn suspicion_score(&self, client: &str) -> u32 {
        let clients = read_or_recover(&self.clients, "client records");
        clients
            .get(client)
            .map(|r| r.suspicion_score)
            .unwrap_or(0)
    }

    /// Reset the score after an auto-ban fires.
    pub fn reset_score(&self, client: &str) {
        let mut clients = write_or_recover(&self.clients, "client records");
        if let Some(record) = clients.get_mut(client) {
            record.suspicion_score = 0;
        }
    }

    // =========================================================================
    // RATE BUCKETS
    // =========================================================================

    /// Increment the fixed-window counter for (client, endpoint) and return
    /// the count within the current window. The window resets lazily; its
    /// end only ever moves forward.
    pub fn increment_bucket(&self, client: &str, endpoint: &str, window_ms: u64) -> u32 {
        let now = self.clock.now_ms();
        let key = bucket_key(client, endpoint);
        let mut buckets = write_or_recover(&self.buckets, "rate buckets");

        let bucket = buckets.entry(key).or_insert(RateBucket {
            count: 0,
            window_reset_at: now + window_ms,
        });
        if now > bucket.window_reset_at {
            bucket.count = 0;
            bucket.window_reset_at = now + window_ms;
        }
        bucket.count += 1;
        bucket.count
    }

    // =========================================================================
    // FINGERPRINTS
    // =========================================================================

    /// Record that a fingerprint was seen now.
    pub fn touch_fingerprint(&self, hash: &str) {
        let now = self.clock.now_ms();
        let mut fingerprints = write_or_recover(&self.fingerprints, "fingerprints");
        fingerprints
            .entry(hash.to_string())
            .and_modify(|f| f.last_seen = now)
            .or_insert(Fingerprint { last_seen: now });
    }

    // =========================================================================
    // JANITOR SWEEP
    // =========================================================================

    /// One full maintenance pass. This is the sole mechanism bounding
    /// memory growth: every map sheds its stale entries here.
    pub fn sweep(
        &self,
        decay_step: u32,
        fingerprint_ttl_ms: u64,
        bucket_grace_ms: u64,
    ) -> SweepStats {
        let now = self.clock.now_ms();
        let mut stats = SweepStats::default();

        {
            let mut clients = write_or_recover(&self.clients, "client records");
            for record in clients.values_mut() {
                if matches!(record.blocked_until, Some(until) if until <= now) {
                    record.blocked_until = None;
                    record.block_reason.clear();
                    stats.expired_blocks += 1;
                }
                if !record.trusted && record.suspicion_score > 0 {
                    record.suspicion_score = record.suspicion_score.saturating_sub(decay_step);
                    stats.decayed_records += 1;
                }
            }
            // Drop records with nothing left to say: no block, no score,
            // not trusted.
            let before = clients.len();
            clients.retain(|_, r| {
                r.trusted || r.suspicion_score > 0 || r.blocked_until.is_some()
            });
            stats.removed_records = before - clients.len();
        }

        {
            let mut fingerprints = write_or_recover(&self.fingerprints, "fingerprints");
            let before = fingerprints.len();
            fingerprints.retain(|_, f| now.saturating_sub(f.last_seen) <= fingerprint_ttl_ms);
            stats.stale_fingerprints = before - fingerprints.len();
        }

        {
            let mut buckets = write_or_recover(&self.buckets, "rate buckets");
            let before = buckets.len();
            buckets.retain(|_, b| now.saturating_sub(b.window_reset_at) <= bucket_grace_ms);
            stats.stale_buckets = before - buckets.len();
        }

        stats
    }

    // =========================================================================
    // ADMIN SNAPSHOTS
    // =========================================================================

    /// Clients with an active block.
    pub fn blocked_clients(&self) -> Vec<ClientSnapshot> {
        let now = self.clock.now_ms();
        let clients = read_or_recover(&self.clients, "client records");
        clients
            .iter()
            .filter(|(_, r)| matches!(r.blocked_until, Some(until) if until > now))
            .map(|(id, r)| snapshot(id, r))
            .collect()
    }

    /// Non-trusted clients carrying a positive suspicion score.
    pub fn suspicious_clients(&self) -> Vec<ClientSnapshot> {
        let clients = read_or_recover(&self.clients, "client records");
        let mut list: Vec<ClientSnapshot> = clients
            .iter()
            .filter(|(_, r)| !r.trusted && r.suspicion_score > 0)
            .map(|(id, r)| snapshot(id, r))
            .collect();
        list.sort_by(|a, b| b.suspicion_score.cmp(&a.suspicion_score));
        list
    }

    pub fn trusted_clients(&self) -> Vec<String> {
        let clients = read_or_recover(&self.clients, "client records");
        clients
            .iter()
            .filter(|(_, r)| r.trusted)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// (clients, buckets, fingerprints) map sizes.
    pub fn sizes(&self) -> (usize, usize, usize) {
        let clients = read_or_recover(&self.clients, "client records").len();
        let buckets = read_or_recover(&self.buckets, "rate buckets").len();
        let fingerprints = read_or_recover(&self.fingerprints, "fingerprints").len();
        (clients, buckets, fingerprints)
    }
}

fn snapshot(id: &str, record: &ClientRecord) -> ClientSnapshot {
    ClientSnapshot {
        client: id.to_string(),
        suspicion_score: record.suspicion_score,
        trusted: record.trusted,
        blocked_until: record.blocked_until,
        block_reason: if record.block_reason.is_empty() {
            None
        } else {
            Some(record.block_reason.clone())
        },
        recent_activity: record.recent_activity.iter().cloned().collect(),
    }
}

fn bucket_key(client: &str, endpoint: &str) -> String {
    format!("{}|{}", client, endpoint)
}

// =============================================================================
// LOCK RECOVERY
// =============================================================================

fn read_or_recover<'a, T>(lock: &'a RwLock<T>, context: &str) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!(
                "RwLock (read) poisoned for '{}' - recovering with potentially stale data",
                context
            );
            poisoned.into_inner()
        }
    }
}

fn write_or_recover<'a, T>(lock: &'a RwLock<T>, context: &str) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!(
                "RwLock (write) poisoned for '{}' - recovering with potentially stale data",
                context
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn test_store() -> (Arc<ManualClock>, ThreatStore) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let audit = Arc::new(AuditSink::in_memory(clock.clone(), 100));
        let store = ThreatStore::new(clock.clone(), audit);
        (clock, store)
    }

    #[test]
    fn test_block_and_expiry_cleared_on_read() {
        let (clock, store) = test_store();

        store.mark_blocked("1.2.3.4", 60, "test block");
        assert!(store.is_blocked("1.2.3.4"));

        // One millisecond past expiry: the very next read must clear it.
        clock.advance_ms(60_000 + 1);
        assert!(!store.is_blocked("1.2.3.4"));

        // The record's blocked state is gone, not just masked.
        assert!(store.blocked_clients().is_empty());
    }

    #[test]
    fn test_trust_clears_suspicion_and_block() {
        let (_clock, store) = test_store();

        store.add_suspicion("5.6.7.8", 120, "probe");
        store.mark_blocked("5.6.7.8", 600, "threshold");
        store.trust("5.6.7.8");

        assert!(store.is_trusted("5.6.7.8"));
        assert!(!store.is_blocked("5.6.7.8"));
        assert_eq!(store.suspicion_score("5.6.7.8"), 0);

        // Trusted clients accumulate nothing.
        assert_eq!(store.add_suspicion("5.6.7.8", 100, "bot"), 0);
        assert_eq!(store.suspicion_score("5.6.7.8"), 0);
    }

    #[test]
    fn test_trusted_client_cannot_be_blocked() {
        let (_clock, store) = test_store();
        store.trust("9.9.9.9");
        store.mark_blocked("9.9.9.9", 600, "should not stick");
        assert!(!store.is_blocked("9.9.9.9"));
    }

    #[test]
    fn test_suspicion_accumulates_and_records_activity() {
        let (_clock, store) = test_store();

        assert_eq!(store.add_suspicion("a", 30, "sql"), 30);
        assert_eq!(store.add_suspicion("a", 30, "traversal"), 60);

        let suspicious = store.suspicious_clients();
        assert_eq!(suspicious.len(), 1);
        assert_eq!(suspicious[0].suspicion_score, 60);
        assert_eq!(suspicious[0].recent_activity.len(), 2);
        assert_eq!(suspicious[0].recent_activity[0].label, "sql");
    }

    #[test]
    fn test_activity_trail_is_capped() {
        let (_clock, store) = test_store();
        for i in 0..30 {
            store.add_suspicion("a", 1, &format!("v{}", i));
        }
        let snap = &store.suspicious_clients()[0];
        assert_eq!(snap.recent_activity.len(), MAX_RECENT_ACTIVITY);
        // Oldest entries evicted first
        assert_eq!(snap.recent_activity[0].label, "v10");
        assert_eq!(snap.recent_activity[19].label, "v29");
    }

    #[test]
    fn test_bucket_window_reset() {
        let (clock, store) = test_store();

        for _ in 0..3 {
            store.increment_bucket("c", "/api/x", 1_000);
        }
        assert_eq!(store.increment_bucket("c", "/api/x", 1_000), 4);

        // Still within the same window
        clock.advance_ms(900);
        assert_eq!(store.increment_bucket("c", "/api/x", 1_000), 5);

        // Past the window end: counter resets
        clock.advance_ms(200);
        assert_eq!(store.increment_bucket("c", "/api/x", 1_000), 1);
    }

    #[test]
    fn test_buckets_are_per_endpoint() {
        let (_clock, store) = test_store();
        store.increment_bucket("c", "/api/a", 1_000);
        store.increment_bucket("c", "/api/a", 1_000);
        assert_eq!(store.increment_bucket("c", "/api/b", 1_000), 1);
    }

    #[test]
    fn test_unblock_and_clear_all() {
        let (_clock, store) = test_store();

        store.mark_blocked("a", 600, "x");
        store.mark_blocked("b", 600, "y");

        assert!(store.unblock("a"));
        assert!(!store.is_blocked("a"));
        assert!(!store.unblock("a")); // already clear
        assert!(!store.unblock("never-seen"));

        assert_eq!(store.clear_all_blocks(), 1);
        assert!(!store.is_blocked("b"));
    }

    #[test]
    fn test_sweep_decays_and_removes() {
        let (clock, store) = test_store();

        store.add_suspicion("low", 5, "probe");
        store.add_suspicion("high", 35, "probe");
        store.trust("vip");
        store.mark_blocked("banned", 1, "short ban");
        store.touch_fingerprint("fp1");
        store.increment_bucket("c", "/e", 1_000);

        clock.advance_ms(2_000);
        let stats = store.sweep(10, 3_600_000, 60_000);

        // "low" decayed 5 -> 0 and removed; "high" decayed 35 -> 25;
        // "banned" block expired and the record dropped.
        assert_eq!(stats.expired_blocks, 1);
        assert_eq!(stats.decayed_records, 2);
        assert_eq!(stats.removed_records, 2);
        assert_eq!(store.suspicion_score("high"), 25);
        assert_eq!(store.suspicion_score("low"), 0);
        assert!(store.is_trusted("vip"));

        // Sweeping again over the now-absent record is a no-op.
        let stats2 = store.sweep(10, 3_600_000, 60_000);
        assert_eq!(stats2.expired_blocks, 0);
        assert_eq!(stats2.removed_records, 0);
    }

    #[test]
    fn test_sweep_evicts_stale_fingerprints_and_buckets() {
        let (clock, store) = test_store();

        store.touch_fingerprint("old");
        store.increment_bucket("c", "/e", 1_000);

        clock.advance_ms(3_600_000 + 1);
        store.touch_fingerprint("fresh");

        let stats = store.sweep(10, 3_600_000, 60_000);
        assert_eq!(stats.stale_fingerprints, 1);
        assert_eq!(stats.stale_buckets, 1);

        let (_, buckets, fingerprints) = store.sizes();
        assert_eq!(buckets, 0);
        assert_eq!(fingerprints, 1);
    }

    #[test]
    fn test_block_emits_audit_event() {
        let (_clock, store) = test_store();
        store.mark_blocked("6.6.6.6", 300, "burst rate exceeded");

        let events = store.audit().recent(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::IpBlocked);
        assert_eq!(events[0].client.as_deref(), Some("6.6.6.6"));
    }
}
