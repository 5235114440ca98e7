/// The per-request state machine.
///
/// Every inbound request flows through [`Engine::evaluate`], which walks
/// the checks in a strict order and produces a single terminal verdict.
/// Rejection bodies are generic on purpose: the response never reveals
/// which rule fired.
///
/// Failure semantics: every optional check fails open. The detectors are
/// total functions, a body that failed to parse is simply not inspected,
/// and an internal fault in scoring or auditing never turns into a
/// rejection. The only fail-closed surface is the block check itself,
/// which serves recovered store state if a lock was poisoned.
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::audit::{AuditEvent, AuditEventType, AuditSeverity};
use crate::config::Config;
use crate::detectors;
use crate::governor;
use crate::scoring::{self, ViolationKind};
use crate::store::ThreatStore;

// =============================================================================
// REQUEST DESCRIPTOR
// =============================================================================

/// Uploaded file metadata as declared by the client.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub mime_type: String,
}

/// Everything the engine needs to know about one inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestDescriptor {
    /// Resolved client identity (normally the source IP)
    pub client: String,
    pub method: String,
    /// Decoded request path
    pub path: String,
    /// Raw URL as received, before any decoding
    pub raw_url: String,
    /// Decoded query parameters
    pub query: Vec<(String, String)>,
    /// Header map with lowercased names
    pub headers: HashMap<String, String>,
    /// Parsed JSON body, when one was present and parseable
    pub body: Option<serde_json::Value>,
    pub uploads: Vec<UploadedFile>,
    /// Set when the surrounding framework validated a session for this
    /// request
    pub session_authenticated: bool,
}

impl RequestDescriptor {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or("")
    }

    /// Stable hash over client identity and client-controlled headers,
    /// used only for the observational fingerprint store.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.client.as_bytes());
        hasher.update(b"|");
        hasher.update(self.user_agent().as_bytes());
        hasher.update(b"|");
        hasher.update(self.header("accept-language").unwrap_or("").as_bytes());
        hasher.update(b"|");
        hasher.update(self.header("accept-encoding").unwrap_or("").as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

// =============================================================================
// EXEMPTIONS
// =============================================================================

/// Which checks are skipped for this request, computed once so the skip
/// logic cannot drift between pipeline stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Exemptions {
    pub skip_injection: bool,
    pub skip_traversal: bool,
    pub skip_depth: bool,
    pub skip_rate: bool,
    /// Request is handled by the upload path; file checks apply instead
    pub upload_path: bool,
}

impl Exemptions {
    pub fn for_request(config: &Config, req: &RequestDescriptor, trusted: bool) -> Self {
        let upload_path = config
            .policy
            .upload_prefixes
            .iter()
            .any(|p| req.path.starts_with(p.as_str()));
        let static_path = config
            .policy
            .static_prefixes
            .iter()
            .any(|p| req.path.starts_with(p.as_str()));
        let is_get = req.method.eq_ignore_ascii_case("GET");

        Self {
            skip_injection: trusted || upload_path || is_get,
            skip_traversal: trusted || upload_path,
            skip_depth: trusted || upload_path,
            skip_rate: trusted || static_path,
            upload_path,
        }
    }
}

// =============================================================================
// VERDICT
// =============================================================================

/// Terminal outcome of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Verdict {
    /// Request proceeds to business logic
    Allow,
    /// Terminal rejection with a generic message
    Reject { status: u16, error: &'static str },
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    fn invalid_request() -> Self {
        Verdict::Reject {
            status: 400,
            error: "Invalid request parameters",
        }
    }

    fn access_denied() -> Self {
        Verdict::Reject {
            status: 403,
            error: "Access denied",
        }
    }

    fn too_many_requests() -> Self {
        Verdict::Reject {
            status: 429,
            error: "Too many requests",
        }
    }
}

/// Hardening headers applied to every response the engine lets through.
/// Unconditional; decorating a response has no failure mode.
pub const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("X-Content-Type-Options", "nosniff"),
    ("X-Frame-Options", "DENY"),
    ("Referrer-Policy", "strict-origin-when-cross-origin"),
    (
        "Permissions-Policy",
        "geolocation=(), microphone=(), camera=()",
    ),
    ("Cross-Origin-Opener-Policy", "same-origin"),
];

// =============================================================================
// ENGINE
// =============================================================================

/// The threat-detection and request-governance engine.
pub struct Engine {
    config: Config,
    store: Arc<ThreatStore>,
}

impl Engine {
    pub fn new(config: Config, store: Arc<ThreatStore>) -> Self {
        Self { config, store }
    }

    pub fn store(&self) -> &Arc<ThreatStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Evaluate one request. Checks run in a strict order; the first hit
    /// is terminal.
    pub fn evaluate(&self, req: &RequestDescriptor) -> Verdict {
        let client = req.client.as_str();

        // Observational only; never consulted in a decision.
        self.store.touch_fingerprint(&req.fingerprint());

        // 1. Trust fast-path: valid session proof marks the client
        //    trusted (idempotent) and clears prior suspicion.
        if req.session_authenticated {
            self.store.trust(client);
        }
        let trusted = self.store.is_trusted(client);

        // 2. Block check. The one fail-closed stage.
        if self.store.is_blocked(client) {
            debug!("rejecting blocked client {}", client);
            return Verdict::access_denied();
        }

        let exemptions = Exemptions::for_request(&self.config, req, trusted);

        // 3. Injection checks over query parameters (non-GET, non-upload).
        if !exemptions.skip_injection {
            let max_len = self.config.policy.max_inspected_len;
            for (key, value) in &req.query {
                if let Some(sig) = detectors::match_sql_injection(value, max_len)
                    .or_else(|| detectors::match_sql_injection(key, max_len))
                {
                    scoring::apply_violation(
                        &self.store,
                        &self.config.policy,
                        client,
                        ViolationKind::SqlInjection,
                        &req.path,
                        &format!("sql signature '{}' in query parameter", sig.name),
                    );
                    return Verdict::invalid_request();
                }
                if let Some(op) = detectors::match_nosql_injection(value, max_len) {
                    scoring::apply_violation(
                        &self.store,
                        &self.config.policy,
                        client,
                        ViolationKind::NoSqlInjection,
                        &req.path,
                        &format!("nosql operator '{}' in query parameter", op),
                    );
                    return Verdict::invalid_request();
                }
            }
        }

        // 4. Path traversal over the raw URL.
        if !exemptions.skip_traversal {
            if let Some(marker) = detectors::match_path_traversal(&req.raw_url) {
                scoring::apply_violation(
                    &self.store,
                    &self.config.policy,
                    client,
                    ViolationKind::PathTraversal,
                    &req.path,
                    &format!("traversal marker '{}' in url", marker),
                );
                return Verdict::invalid_request();
            }
        }

        // 4b. File checks, only on the upload path and only when files
        //     are present.
        if exemptions.upload_path {
            for file in &req.uploads {
                if detectors::is_dangerous_extension(&file.filename) {
                    scoring::apply_violation(
                        &self.store,
                        &self.config.policy,
                        client,
                        ViolationKind::DangerousFileExtension,
                        &req.path,
                        &format!("dangerous upload extension: {}", file.filename),
                    );
                    return Verdict::invalid_request();
                }
                if detectors::has_double_extension_attack(&file.filename) {
                    scoring::apply_violation(
                        &self.store,
                        &self.config.policy,
                        client,
                        ViolationKind::DoubleExtensionAttack,
                        &req.path,
                        &format!("double-extension upload: {}", file.filename),
                    );
                    return Verdict::invalid_request();
                }
            }
        }

        // 5. Bot check. Runs for every client, trusted included: a valid
        //    session driving a scanner UA is itself a compromise signal.
        if let Some(marker) = detectors::match_malicious_user_agent(req.user_agent()) {
            scoring::apply_violation(
                &self.store,
                &self.config.policy,
                client,
                ViolationKind::MaliciousUserAgent,
                &req.path,
                &format!("offensive tool signature '{}' in user agent", marker),
            );
            return Verdict::access_denied();
        }

        // 6. Body shape guard. Resource-exhaustion defense, not a
        //    signature match, so it carries no suspicion score.
        if !exemptions.skip_depth {
            if let Some(body) = &req.body {
                let depth = detectors::json_depth(body);
                if depth > self.config.policy.max_json_depth {
                    self.store.audit().record(
                        AuditEvent::new(
                            AuditEventType::RequestDepthExceeded,
                            AuditSeverity::Medium,
                            "json body nested too deeply",
                        )
                        .with_client(client)
                        .with_path(&req.path)
                        .with_context(serde_json::json!({
                            "depth": depth,
                            "max": self.config.policy.max_json_depth,
                        })),
                    );
                    return Verdict::invalid_request();
                }
            }
        }

        // 7. Burst-rate governance.
        if !exemptions.skip_rate {
            let decision = governor::check(&self.store, &self.config.rate, client, &req.path);
            if !decision.is_allowed() {
                return Verdict::too_many_requests();
            }
        }

        // 8. Allow. The caller decorates the response with
        //    SECURITY_HEADERS.
        Verdict::Allow
    }
}
