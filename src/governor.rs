/// Burst-rate governance (DDoS mitigation).
///
/// Fixed one-second window per (client, endpoint). Exceeding the burst
/// limit inside a single window is classified as a DDoS burst: the client
/// is blocked for five minutes and the request is rejected with 429.
use serde::Serialize;
use tracing::warn;

use crate::audit::{AuditEvent, AuditEventType, AuditSeverity};
use crate::config::RateConfig;
use crate::store::ThreatStore;

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RateDecision {
    /// Within the limit; carries the count inside the current window
    Allowed { count: u32 },
    /// Burst detected; client has been blocked
    Limited { count: u32 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Count this request against the client's window and decide.
///
/// Exactly `burst_limit` requests pass within one window; the next one
/// trips the governor.
pub fn check(store: &ThreatStore, rate: &RateConfig, client: &str, endpoint: &str) -> RateDecision {
    let count = store.increment_bucket(client, endpoint, rate.window_ms);
    if count <= rate.burst_limit {
        return RateDecision::Allowed { count };
    }

    warn!(
        "burst detected: {} hit {} {} times inside one window",
        client, endpoint, count
    );
    store.audit().record(
        AuditEvent::new(
            AuditEventType::DdosDetected,
            AuditSeverity::Critical,
            "request burst exceeded per-endpoint limit",
        )
        .with_client(client)
        .with_path(endpoint)
        .with_context(serde_json::json!({
            "count": count,
            "limit": rate.burst_limit,
            "window_ms": rate.window_ms,
        })),
    );
    store.mark_blocked(client, rate.burst_block_secs, "burst rate exceeded");

    RateDecision::Limited { count }
}
