/// Admin introspection HTTP API.
///
/// Read-only views of the threat state plus the manual overrides
/// (unblock, clear-all) and the audit/scan reports. Consumed by a
/// separate admin UI; base path `/palisade/api`.
use anyhow::Result;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::pipeline::Engine;

/// Maximum allowed admin request body size. Prevents memory exhaustion
/// from oversized payloads.
const MAX_REQUEST_BODY_SIZE: usize = 64 * 1024;

async fn read_body_limited(body: Body) -> Result<Vec<u8>, String> {
    use futures::StreamExt;

    let mut total_size = 0usize;
    let mut result = Vec::new();

    let mut stream = body;
    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| format!("error reading body: {}", e))?;
        total_size += chunk.len();
        if total_size > MAX_REQUEST_BODY_SIZE {
            return Err(format!(
                "request body exceeds maximum of {} bytes",
                MAX_REQUEST_BODY_SIZE
            ));
        }
        result.extend_from_slice(&chunk);
    }

    Ok(result)
}

// =============================================================================
// API RESPONSE
// =============================================================================

/// Standard admin API response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ApiResponse {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn success_message(message: &str) -> Self {
        Self {
            success: true,
            message: message.to_string(),
            data: None,
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            data: None,
        }
    }
}

// =============================================================================
// SCAN REQUEST
// =============================================================================

/// Input for the transport-security scan: the response headers the site
/// currently serves, and whether it is reached over TLS.
#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub https: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ScanFinding {
    #[serde(rename = "type")]
    finding_type: &'static str,
    severity: &'static str,
    details: String,
    recommendation: &'static str,
}

/// Response headers every deployment is expected to serve.
const REQUIRED_SECURITY_HEADERS: &[&str] = &[
    "Content-Security-Policy",
    "X-Content-Type-Options",
    "X-Frame-Options",
    "Strict-Transport-Security",
    "Referrer-Policy",
];

/// Protections this engine enforces, reported by the audit endpoint.
const ENABLED_PROTECTIONS: &[&str] = &[
    "sql_injection_detection",
    "nosql_injection_detection",
    "path_traversal_detection",
    "malicious_bot_detection",
    "upload_extension_screening",
    "json_depth_guard",
    "burst_rate_governance",
    "auto_ban_on_suspicion_threshold",
    "security_response_headers",
];

// =============================================================================
// API HANDLER
// =============================================================================

pub struct AdminApi {
    engine: Arc<Engine>,
}

impl AdminApi {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Route an admin request.
    pub async fn handle_request(&self, req: Request<Body>) -> Result<Response<Body>> {
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        let method = req.method().clone();

        debug!("admin API request: {} {}", method, path);

        match (method, path.as_str()) {
            (Method::GET, "/palisade/api/health") => self.handle_health(),
            (Method::GET, "/palisade/api/status") => self.handle_status(),
            (Method::GET, "/palisade/api/events") => self.handle_events(&query),
            (Method::POST, p) if p.starts_with("/palisade/api/unblock/") => {
                let client = p.trim_start_matches("/palisade/api/unblock/");
                self.handle_unblock(client)
            }
            (Method::POST, "/palisade/api/clear") => self.handle_clear_all(),
            (Method::GET, "/palisade/api/audit") => self.handle_run_audit(),
            (Method::POST, "/palisade/api/scan") => self.handle_scan(req).await,
            _ => json_response(
                StatusCode::NOT_FOUND,
                &ApiResponse::error("Endpoint not found"),
            ),
        }
    }

    fn handle_health(&self) -> Result<Response<Body>> {
        json_response(
            StatusCode::OK,
            &ApiResponse::success(serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
            })),
        )
    }

    // =========================================================================
    // STATE INTROSPECTION
    // =========================================================================

    fn handle_status(&self) -> Result<Response<Body>> {
        let store = self.engine.store();
        let (clients, buckets, fingerprints) = store.sizes();

        json_response(
            StatusCode::OK,
            &ApiResponse::success(serde_json::json!({
                "blocked": store.blocked_clients(),
                "suspicious": store.suspicious_clients(),
                "trusted": store.trusted_clients(),
                "store": {
                    "clients": clients,
                    "rate_buckets": buckets,
                    "fingerprints": fingerprints,
                },
                "audit": {
                    "events_recorded": store.audit().events_recorded(),
                    "write_failures": store.audit().write_failures(),
                },
            })),
        )
    }

    fn handle_events(&self, query: &str) -> Result<Response<Body>> {
        let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        let limit = params
            .get("limit")
            .and_then(|s| s.parse().ok())
            .unwrap_or(100)
            .min(1000);

        let events = self.engine.store().audit().recent(limit);
        json_response(
            StatusCode::OK,
            &ApiResponse::success(serde_json::json!({ "events": events })),
        )
    }

    // =========================================================================
    // MANUAL OVERRIDES
    // =========================================================================

    fn handle_unblock(&self, client: &str) -> Result<Response<Body>> {
        if client.is_empty() {
            return json_response(
                StatusCode::BAD_REQUEST,
                &ApiResponse::error("Missing client identity"),
            );
        }

        if self.engine.store().unblock(client) {
            json_response(
                StatusCode::OK,
                &ApiResponse::success_message("Client unblocked"),
            )
        } else {
            json_response(
                StatusCode::NOT_FOUND,
                &ApiResponse::error("No active block for that client"),
            )
        }
    }

    fn handle_clear_all(&self) -> Result<Response<Body>> {
        let cleared = self.engine.store().clear_all_blocks();
        json_response(
            StatusCode::OK,
            &ApiResponse::success(serde_json::json!({ "cleared": cleared })),
        )
    }

    // =========================================================================
    // AUDIT REPORT
    // =========================================================================

    /// Computed health score plus the static list of enabled protections.
    fn handle_run_audit(&self) -> Result<Response<Body>> {
        let store = self.engine.store();
        let blocked = store.blocked_clients();
        let suspicious = store.suspicious_clients();

        let mut score: i64 = 100;
        score -= (blocked.len() as i64 * 5).min(30);
        score -= (suspicious.len() as i64 * 2).min(20);
        let score = score.max(0) as u32;

        let mut recommendations: Vec<serde_json::Value> = Vec::new();
        if !blocked.is_empty() {
            recommendations.push(serde_json::json!({
                "priority": "high",
                "action": "Review currently blocked clients for repeat offenders",
                "impact": "Persistent attackers may warrant upstream filtering",
            }));
        }
        if !suspicious.is_empty() {
            recommendations.push(serde_json::json!({
                "priority": "medium",
                "action": "Inspect recent activity of high-suspicion clients",
                "impact": "Early intervention before the auto-ban threshold",
            }));
        }
        recommendations.push(serde_json::json!({
            "priority": "medium",
            "action": "Keep request logging and monitoring enabled",
            "impact": "Enables threat detection and forensics",
        }));

        json_response(
            StatusCode::OK,
            &ApiResponse::success(serde_json::json!({
                "securityScore": score,
                "grade": security_grade(score),
                "protections": ENABLED_PROTECTIONS,
                "activeBlocks": blocked.len(),
                "suspiciousClients": suspicious.len(),
                "recommendations": recommendations,
            })),
        )
    }

    // =========================================================================
    // VULNERABILITY SCAN
    // =========================================================================

    /// Transport-security assessment of the deployment's outward-facing
    /// responses.
    async fn handle_scan(&self, req: Request<Body>) -> Result<Response<Body>> {
        let body = match read_body_limited(req.into_body()).await {
            Ok(b) => b,
            Err(e) => return json_response(StatusCode::BAD_REQUEST, &ApiResponse::error(&e)),
        };

        let scan: ScanRequest = if body.is_empty() {
            ScanRequest::default()
        } else {
            match serde_json::from_slice(&body) {
                Ok(s) => s,
                Err(e) => {
                    return json_response(
                        StatusCode::BAD_REQUEST,
                        &ApiResponse::error(&format!("Invalid scan request: {}", e)),
                    )
                }
            }
        };

        let report = run_vulnerability_scan(&scan);
        json_response(StatusCode::OK, &ApiResponse::success(report))
    }
}

fn run_vulnerability_scan(scan: &ScanRequest) -> serde_json::Value {
    let mut findings: Vec<ScanFinding> = Vec::new();

    let present: Vec<String> = scan.headers.keys().map(|k| k.to_ascii_lowercase()).collect();
    let missing: Vec<&str> = REQUIRED_SECURITY_HEADERS
        .iter()
        .copied()
        .filter(|h| !present.contains(&h.to_ascii_lowercase()))
        .collect();

    if !missing.is_empty() {
        findings.push(ScanFinding {
            finding_type: "MISSING_SECURITY_HEADERS",
            severity: "medium",
            details: format!("Missing headers: {}", missing.join(", ")),
            recommendation: "Add security headers to all responses",
        });
    }

    if !scan.https {
        findings.push(ScanFinding {
            finding_type: "INSECURE_TRANSPORT",
            severity: "high",
            details: "Site is served over plain HTTP".to_string(),
            recommendation: "Terminate TLS and redirect HTTP to HTTPS",
        });
    }

    let deduction: u32 = findings
        .iter()
        .map(|f| match f.severity {
            "critical" => 25,
            "high" => 15,
            "medium" => 8,
            _ => 3,
        })
        .sum();
    let score = 100u32.saturating_sub(deduction);

    let count = |sev: &str| findings.iter().filter(|f| f.severity == sev).count();

    serde_json::json!({
        "securityScore": score,
        "grade": security_grade(score),
        "vulnerabilities": findings,
        "summary": {
            "critical": count("critical"),
            "high": count("high"),
            "medium": count("medium"),
            "low": count("low"),
        },
    })
}

/// Letter grade for a 0-100 security score.
fn security_grade(score: u32) -> &'static str {
    match score {
        90..=100 => "A",
        80..=89 => "B",
        70..=79 => "C",
        60..=69 => "D",
        _ => "F",
    }
}

fn json_response(status: StatusCode, response: &ApiResponse) -> Result<Response<Body>> {
    Ok(Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_string(response)?))?)
}
