//! # ci-scaler HTTP Service
//!
//! The deployable half of ci-scaler: the axum ingress endpoint that feeds
//! webhook deliveries into the core pipeline, and the process orchestration
//! that ties the webhook lifecycle, the reconciliation loop and graceful
//! shutdown together.
//!
//! Request handling stays deliberately thin: read the body, parse it as a
//! JSON object, hand it to [`WebhookService::handle`], serialize the
//! response envelope, and write one access-log line with the suffix the
//! pipeline produced.

use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use ci_scaler_core::{
    CiPlatform, CloudAutoscaler, ImageRegistry, IngressRequest, IngressResponse, PlatformError,
    Reconciler, ReconcilerConfig, WebhookService,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod adapters;
pub mod config;

pub use config::{CliArgs, ConfigError, ServiceConfig};

const SERVICE_TICK_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// Errors and exit
// ============================================================================

/// Failures that abort the service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to bind {address}: {message}")]
    BindFailed { address: String, message: String },

    #[error("HTTP server failed: {message}")]
    ServerFailed { message: String },

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Why a successful run returned: the only way out is a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Interrupted,
}

// ============================================================================
// HTTP layer
// ============================================================================

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub webhooks: Arc<WebhookService>,
}

/// Every path is served by the same handler: the pipeline itself routes the
/// loopback debug paths, everything else is a webhook delivery.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .fallback(handle_post)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_post(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return respond_logged(&method, &uri, 405, &json!({"error": "only POST is supported"}), "");
    }

    // An empty body still gets a valid signature over the bytes `{}`.
    let raw_body = if body.is_empty() {
        Bytes::from_static(b"{}")
    } else {
        body
    };
    let payload: Value = match serde_json::from_slice(&raw_body) {
        Ok(payload @ Value::Object(_)) => payload,
        _ => {
            warn!("Error: Invalid JSON (HTTP 400)");
            return respond_logged(&method, &uri, 400, &json!({"error": "Invalid JSON"}), "");
        }
    };
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let outcome: IngressResponse = state
        .webhooks
        .handle(IngressRequest {
            path: uri.path().to_string(),
            client_ip: peer.ip(),
            signature,
            payload,
            raw_body,
        })
        .await;

    respond_logged(
        &method,
        &uri,
        outcome.status,
        &outcome.body(),
        &outcome.log_suffix,
    )
}

/// Serialize the JSON envelope, write the access-log line, and build the
/// HTTP response.
fn respond_logged(method: &Method, uri: &Uri, status: u16, body: &Value, suffix: &str) -> Response {
    let text = format!("{body}\n");
    if suffix.is_empty() {
        info!("\"{method} {}\" {status} {}", uri.path(), text.len());
    } else {
        info!("\"{method} {}\" {status} {} {suffix}", uri.path(), text.len());
    }
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        [(header::CONTENT_TYPE, "application/json")],
        text,
    )
        .into_response()
}

// ============================================================================
// Orchestration
// ============================================================================

/// Wire everything up and serve until a signal arrives:
/// register webhooks, bind the listener (with `SO_REUSEPORT`, so a restarted
/// container can take over the port immediately), spawn the reconciler and
/// the webhook service tick, then serve. On SIGINT/SIGTERM the server drains,
/// the background tasks stop, and the webhooks are deregistered.
pub async fn run(
    config: ServiceConfig,
    cloud: Arc<dyn CloudAutoscaler>,
    platform: Arc<dyn CiPlatform>,
    registry: Arc<dyn ImageRegistry>,
) -> Result<RunExit, ServiceError> {
    let webhooks = Arc::new(WebhookService::new(
        cloud.clone(),
        platform.clone(),
        config.domain.clone(),
        config.asg_specs.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        platform,
        cloud,
        registry,
        config.asg_specs.clone(),
        ReconcilerConfig {
            poll_interval: config.poll_interval,
            max_idle_age_sec: config.max_idle_age_sec,
            max_offline_age_sec: config.max_offline_age_sec,
        },
    ));

    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| ServiceError::ServerFailed {
        message: format!("installing the SIGINT handler failed: {e}"),
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| ServiceError::ServerFailed {
        message: format!("installing the SIGTERM handler failed: {e}"),
    })?;

    webhooks.register_webhooks().await?;

    // Whatever happens past this point, the webhooks get released.
    let serve_result: Result<(), ServiceError> = async {
        let listener = bind_reuseport(config.port)?;
        info!(port = config.port, "listening for webhook events");

        let reconciler_task = tokio::spawn({
            let reconciler = reconciler.clone();
            async move { reconciler.run().await }
        });
        let tick_task = tokio::spawn({
            let webhooks = webhooks.clone();
            async move {
                let mut interval = tokio::time::interval(SERVICE_TICK_INTERVAL);
                loop {
                    interval.tick().await;
                    webhooks.service_tick().await;
                }
            }
        });

        let app = create_router(AppState {
            webhooks: webhooks.clone(),
        });
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT, exiting..."),
                _ = sigterm.recv() => info!("received SIGTERM, exiting..."),
            }
        })
        .await;

        reconciler_task.abort();
        tick_task.abort();
        result.map_err(|e| ServiceError::ServerFailed {
            message: e.to_string(),
        })
    }
    .await;

    webhooks.unregister_webhooks().await;

    serve_result?;
    Ok(RunExit::Interrupted)
}

fn bind_reuseport(port: u16) -> Result<tokio::net::TcpListener, ServiceError> {
    let address = SocketAddr::from(([0, 0, 0, 0], port));
    let bind = |address: SocketAddr| -> std::io::Result<tokio::net::TcpListener> {
        let socket = tokio::net::TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.set_reuseport(true)?;
        socket.bind(address)?;
        socket.listen(1024)
    };
    bind(address).map_err(|e| ServiceError::BindFailed {
        address: address.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
