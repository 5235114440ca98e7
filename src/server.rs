/// Edge HTTP server.
///
/// Every inbound request runs through the engine before any business
/// logic; the admin API is mounted under `/palisade/api`. The upstream
/// handlers here are a demo surface standing in for the application the
/// engine protects.
use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::admin::AdminApi;
use crate::ip;
use crate::pipeline::{Engine, RequestDescriptor, UploadedFile, Verdict, SECURITY_HEADERS};

/// Maximum inspected request body size. Larger bodies are passed through
/// uninspected (fail open) rather than buffered without bound.
const MAX_INSPECTED_BODY_SIZE: usize = 256 * 1024;

/// Upload manifest shape accepted by the demo upload endpoint.
#[derive(Debug, serde::Deserialize)]
struct UploadManifest {
    #[serde(default)]
    files: Vec<UploadManifestEntry>,
}

#[derive(Debug, serde::Deserialize)]
struct UploadManifestEntry {
    filename: String,
    #[serde(default)]
    mime_type: String,
}

// =============================================================================
// DESCRIPTOR CONSTRUCTION
// =============================================================================

/// Build the engine's request descriptor from a hyper request.
///
/// Any part that fails to parse (bad UTF-8 body, invalid JSON) is simply
/// left absent; inspection fails open by design.
async fn build_descriptor(
    engine: &Engine,
    peer_ip: &str,
    req: Request<Body>,
) -> (RequestDescriptor, Request<Body>) {
    let (parts, body) = req.into_parts();

    let raw_url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let query: Vec<(String, String)> = parts
        .uri
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();

    let headers: HashMap<String, String> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    let mut descriptor = RequestDescriptor {
        client: String::new(),
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        raw_url,
        query,
        headers,
        body: None,
        uploads: Vec::new(),
        // The auth layer upstream validates the session; the engine only
        // consumes its presence.
        session_authenticated: false,
    };
    descriptor.session_authenticated = descriptor.header("x-session-token").is_some();

    let source = ip::resolve_client_ip(&engine.config().ip, &descriptor, peer_ip);
    descriptor.client = source.ip().to_string();

    // Buffer and parse JSON bodies for depth inspection and the upload
    // manifest. Oversized or unparseable bodies are not inspected.
    let body_bytes = hyper::body::to_bytes(body).await.unwrap_or_default();
    if !body_bytes.is_empty() && body_bytes.len() <= MAX_INSPECTED_BODY_SIZE {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body_bytes) {
            if let Ok(manifest) = serde_json::from_value::<UploadManifest>(value.clone()) {
                descriptor.uploads = manifest
                    .files
                    .into_iter()
                    .map(|f| UploadedFile {
                        filename: f.filename,
                        mime_type: f.mime_type,
                    })
                    .collect();
            }
            descriptor.body = Some(value);
        }
    }

    let rebuilt = Request::from_parts(parts, Body::from(body_bytes));
    (descriptor, rebuilt)
}

// =============================================================================
// RESPONSES
// =============================================================================

fn rejection_response(status: u16, error: &str) -> Response<Body> {
    let body = serde_json::json!({ "success": false, "error": error });
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN))
        .header("Content-Type", "application/json");
    for (name, value) in SECURITY_HEADERS {
        builder = builder.header(*name, *value);
    }
    builder
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn decorate(mut response: Response<Body>) -> Response<Body> {
    let headers = response.headers_mut();
    for (name, value) in SECURITY_HEADERS {
        if let (Ok(n), Ok(v)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            hyper::header::HeaderValue::from_str(value),
        ) {
            headers.insert(n, v);
        }
    }
    response
}

// =============================================================================
// DEMO UPSTREAM
// =============================================================================

/// Stand-in for the protected application.
fn demo_upstream(req: &Request<Body>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => Response::new(Body::from(
            "palisade request-governance engine\nStatus: Active\n",
        )),
        (&Method::GET, "/health") => {
            let health = serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
            });
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .body(Body::from(health.to_string()))
                .unwrap_or_else(|_| Response::new(Body::empty()))
        }
        _ => {
            let body = serde_json::json!({
                "success": true,
                "path": req.uri().path(),
            });
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap_or_else(|_| Response::new(Body::empty()))
        }
    }
}

// =============================================================================
// SERVICE
// =============================================================================

/// Handle one request end to end.
pub async fn handle_request(
    engine: Arc<Engine>,
    admin: Arc<AdminApi>,
    peer_ip: String,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    // Admin routes bypass the pipeline; in production they sit behind a
    // separate listener or auth wall.
    if req.uri().path().starts_with("/palisade/api/") {
        return match admin.handle_request(req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("admin API error: {}", e);
                Ok(rejection_response(500, "Internal error"))
            }
        };
    }

    let (descriptor, req) = build_descriptor(&engine, &peer_ip, req).await;

    match engine.evaluate(&descriptor) {
        Verdict::Allow => Ok(decorate(demo_upstream(&req))),
        Verdict::Reject { status, error } => {
            warn!(
                "{} {} from {} rejected with {}",
                descriptor.method, descriptor.path, descriptor.client, status
            );
            Ok(rejection_response(status, error))
        }
    }
}

/// Bind and serve until shutdown.
pub async fn run(addr: SocketAddr, engine: Arc<Engine>) -> Result<()> {
    let admin = Arc::new(AdminApi::new(engine.clone()));

    let make_svc = make_service_fn(move |conn: &hyper::server::conn::AddrStream| {
        let engine = engine.clone();
        let admin = admin.clone();
        let peer_ip = conn.remote_addr().ip().to_string();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(engine.clone(), admin.clone(), peer_ip.clone(), req)
            }))
        }
    });

    info!("listening on http://{}", addr);
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::store::ThreatStore;

    fn test_engine() -> Arc<Engine> {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let audit = Arc::new(AuditSink::in_memory(clock.clone(), 100));
        let store = Arc::new(ThreatStore::new(clock, audit));
        Arc::new(Engine::new(Config::default(), store))
    }

    #[tokio::test]
    async fn test_descriptor_from_hyper_request() {
        let engine = test_engine();
        let req = Request::builder()
            .method("POST")
            .uri("/api/contact?q=hello&page=2")
            .header("User-Agent", "Mozilla/5.0")
            .header("X-Session-Token", "abc")
            .body(Body::from(r#"{"message": "hi"}"#))
            .unwrap();

        let (descriptor, _) = build_descriptor(&engine, "198.51.100.5", req).await;
        assert_eq!(descriptor.method, "POST");
        assert_eq!(descriptor.path, "/api/contact");
        assert_eq!(descriptor.raw_url, "/api/contact?q=hello&page=2");
        assert_eq!(descriptor.query.len(), 2);
        assert_eq!(descriptor.user_agent(), "Mozilla/5.0");
        assert!(descriptor.session_authenticated);
        assert_eq!(descriptor.client, "198.51.100.5");
        assert_eq!(descriptor.body.as_ref().unwrap()["message"], "hi");
    }

    #[tokio::test]
    async fn test_forwarded_header_resolved_through_trusted_proxy() {
        let engine = test_engine();
        let req = Request::builder()
            .uri("/")
            .header("X-Forwarded-For", "203.0.113.44")
            .body(Body::empty())
            .unwrap();

        let (descriptor, _) = build_descriptor(&engine, "127.0.0.1", req).await;
        assert_eq!(descriptor.client, "203.0.113.44");
    }

    #[tokio::test]
    async fn test_upload_manifest_parsed() {
        let engine = test_engine();
        let req = Request::builder()
            .method("POST")
            .uri("/api/upload")
            .body(Body::from(
                r#"{"files": [{"filename": "shell.php.jpg", "mime_type": "image/jpeg"}]}"#,
            ))
            .unwrap();

        let (descriptor, _) = build_descriptor(&engine, "1.2.3.4", req).await;
        assert_eq!(descriptor.uploads.len(), 1);
        assert_eq!(descriptor.uploads[0].filename, "shell.php.jpg");
    }

    #[tokio::test]
    async fn test_malformed_body_fails_open() {
        let engine = test_engine();
        let req = Request::builder()
            .method("POST")
            .uri("/api/data")
            .body(Body::from("{not json"))
            .unwrap();

        let (descriptor, _) = build_descriptor(&engine, "1.2.3.4", req).await;
        assert!(descriptor.body.is_none());
    }

    #[tokio::test]
    async fn test_allowed_response_carries_security_headers() {
        let engine = test_engine();
        let admin = Arc::new(AdminApi::new(engine.clone()));
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = handle_request(engine, admin, "9.9.9.9".to_string(), req)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("X-Content-Type-Options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get("X-Frame-Options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn test_rejection_body_is_generic() {
        let engine = test_engine();
        let admin = Arc::new(AdminApi::new(engine.clone()));
        let req = Request::builder()
            .uri("/")
            .header("User-Agent", "sqlmap/1.6")
            .body(Body::empty())
            .unwrap();

        let response = handle_request(engine, admin, "9.9.9.8".to_string(), req)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Access denied");
        // No hint of which rule fired
        assert!(body.get("rule").is_none());
    }
}
