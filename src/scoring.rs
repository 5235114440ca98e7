/// Violation scoring and auto-ban policy.
///
/// Converts a detected violation into a score delta and, at the
/// threshold, a time-boxed block. The point table and the threshold are
/// fixed policy constants; re-tuning them is a config change, not a code
/// change.
use serde::Serialize;
use tracing::warn;

use crate::audit::{AuditEvent, AuditEventType, AuditSeverity};
use crate::config::PolicyConfig;
use crate::store::ThreatStore;

/// Category of detected violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    SqlInjection,
    NoSqlInjection,
    PathTraversal,
    MaliciousUserAgent,
    DangerousFileExtension,
    DoubleExtensionAttack,
}

impl ViolationKind {
    /// Score delta added per observation.
    pub fn points(&self) -> u32 {
        match self {
            ViolationKind::SqlInjection => 30,
            ViolationKind::NoSqlInjection => 30,
            ViolationKind::PathTraversal => 30,
            ViolationKind::MaliciousUserAgent => 100,
            ViolationKind::DangerousFileExtension => 50,
            ViolationKind::DoubleExtensionAttack => 30,
        }
    }

    pub fn severity(&self) -> AuditSeverity {
        match self {
            ViolationKind::SqlInjection => AuditSeverity::High,
            ViolationKind::NoSqlInjection => AuditSeverity::High,
            ViolationKind::PathTraversal => AuditSeverity::High,
            ViolationKind::MaliciousUserAgent => AuditSeverity::Medium,
            ViolationKind::DangerousFileExtension => AuditSeverity::High,
            ViolationKind::DoubleExtensionAttack => AuditSeverity::High,
        }
    }

    pub fn event_type(&self) -> AuditEventType {
        match self {
            ViolationKind::SqlInjection => AuditEventType::SqlInjectionAttempt,
            ViolationKind::NoSqlInjection => AuditEventType::NosqlInjectionAttempt,
            ViolationKind::PathTraversal => AuditEventType::PathTraversalAttempt,
            ViolationKind::MaliciousUserAgent => AuditEventType::MaliciousBotBlocked,
            ViolationKind::DangerousFileExtension => AuditEventType::DangerousFileUpload,
            ViolationKind::DoubleExtensionAttack => AuditEventType::DangerousFileUpload,
        }
    }

    /// Label stored in the client's activity trail.
    pub fn label(&self) -> &'static str {
        match self {
            ViolationKind::SqlInjection => "sql_injection",
            ViolationKind::NoSqlInjection => "nosql_injection",
            ViolationKind::PathTraversal => "path_traversal",
            ViolationKind::MaliciousUserAgent => "malicious_user_agent",
            ViolationKind::DangerousFileExtension => "dangerous_file_extension",
            ViolationKind::DoubleExtensionAttack => "double_extension_attack",
        }
    }
}

/// Outcome of applying one violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreOutcome {
    pub new_score: u32,
    pub banned: bool,
}

/// Add the violation's points to the client's score and auto-ban at the
/// threshold. Trusted clients are fully exempt (score stays 0, no ban).
///
/// After a ban the score resets to zero so the next ban requires a fresh
/// run of violations rather than firing on every subsequent hit.
pub fn apply_violation(
    store: &ThreatStore,
    policy: &PolicyConfig,
    client: &str,
    kind: ViolationKind,
    path: &str,
    detail: &str,
) -> ScoreOutcome {
    let new_score = store.add_suspicion(client, kind.points(), kind.label());

    store.audit().record(
        AuditEvent::new(kind.event_type(), kind.severity(), detail)
            .with_client(client)
            .with_path(path)
            .with_context(serde_json::json!({
                "violation": kind,
                "score": new_score,
            })),
    );

    if new_score >= policy.ban_threshold && !store.is_trusted(client) {
        warn!(
            "client {} crossed suspicion threshold ({} >= {}), blocking",
            client, new_score, policy.ban_threshold
        );
        store.mark_blocked(client, policy.ban_duration_secs, "suspicion threshold exceeded");
        store.reset_score(client);
        return ScoreOutcome { new_score, banned: true };
    }

    ScoreOutcome { new_score, banned: false }
}
