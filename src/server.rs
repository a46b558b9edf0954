//! HTTP surface: health, read-only status, and signed webhook ingestion.
//!
//! | Route | Auth |
//! |-------|------|
//! | `GET /health` | none |
//! | `GET /status` | bearer `api_key`, when configured |
//! | `POST /webhooks/:module/:source` | HMAC-SHA256 body signature |

use crate::module::ModuleState;
use crate::runtime::{Runtime, RuntimeStatus};
use crate::scheduler::IngestError;
use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::future::Future;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Clone)]
struct AppState {
    runtime: Arc<Runtime>,
    api_key: Option<String>,
    host: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    version: &'static str,
    host: String,
    #[serde(flatten)]
    runtime: RuntimeStatus,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// Build the router. `api_key` guards `/status` when set.
pub fn build_router(runtime: Arc<Runtime>, api_key: Option<String>) -> Router {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    let state = Arc::new(AppState {
        runtime,
        api_key: api_key.filter(|k| !k.is_empty()),
        host,
    });

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/webhooks/:module/:source", post(receive_webhook))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then stop accepting connections and let
/// in-flight requests finish.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Tributary server listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // Webhooks carry their own signature
    let path = req.uri().path();
    if path == "/health" || path.starts_with("/webhooks/") {
        return Ok(next.run(req).await);
    }
    let Some(api_key) = &state.api_key else {
        return Ok(next.run(req).await);
    };

    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "));

    match token {
        Some(token) if bool::from(token.as_bytes().ct_eq(api_key.as_bytes())) => Ok(next.run(req).await),
        Some(_) => {
            warn!("Invalid API Key attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        host: state.host.clone(),
        runtime: state.runtime.status(),
    })
}

async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path((module, source)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let instance = state
        .runtime
        .module(&module)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("unknown module '{}'", module)))?;
    if instance.state() != ModuleState::Active {
        return Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("module '{}' is {}", module, instance.state()),
        ));
    }

    let runner = instance
        .source_runner(&source)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("unknown source '{}'", source)))?;
    let (Some(handler), Some(secret)) = (runner.webhook_handler(), runner.webhook_secret()) else {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("source '{}' does not accept webhooks", source),
        ));
    };

    let signature = headers
        .get(handler.signature_header())
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(secret.as_bytes(), &body, signature) {
        warn!(module = %module, source = %source, "Webhook signature rejected");
        return Err(api_error(StatusCode::UNAUTHORIZED, "invalid signature"));
    }

    match runner.accept_webhook(&body).await {
        Ok(accepted) => {
            debug!(module = %module, source = %source, accepted, "Webhook accepted");
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "status": "accepted", "events": accepted })),
            ))
        }
        Err(IngestError::Payload(e)) => Err(api_error(StatusCode::BAD_REQUEST, e.to_string())),
        Err(IngestError::NotWebhook) => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("source '{}' does not accept webhooks", source),
        )),
        Err(e @ IngestError::Buffer(_)) => {
            warn!(module = %module, source = %source, error = %e, "Webhook buffer write failed");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// `sha256=<hex>` HMAC of `body` under `secret`.
pub fn sign_body(secret: &[u8], body: &[u8]) -> String {
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac_of(secret, body)))
}

/// Constant-time check of a `sha256=<hex>` signature.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let Some(hex_digest) = signature.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(provided) = hex::decode(hex_digest) else {
        return false;
    };
    let expected = mac_of(secret, body);
    bool::from(expected.as_slice().ct_eq(provided.as_slice()))
}

fn mac_of(secret: &[u8], body: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}
