//! Chat Gateway
//!
//! Single-binary Rust service that:
//! 1. Accepts OpenAI-style chat completion requests
//! 2. Leases one upstream session credential per request from a bounded pool
//! 3. Relays the exchange to the session-based upstream gateway
//! 4. Streams the answer back as `chat.completion.chunk` server-sent events

mod auth;
mod completions;
mod config;
mod error;
mod metrics;
mod models;
mod relay;
mod service;
#[cfg(test)]
mod testing;
mod wire;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, middleware};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;
use session_pool::Pool;
use upstream::{HttpGatewayAdapter, SessionAdapter};

use crate::auth::AccessGate;
use crate::completions::ChatState;
use crate::config::Config;
use crate::error::GatewayError;
use crate::models::ModelRegistry;
use crate::service::{DRAIN_TIMEOUT, InFlight, ServiceMetrics};
use crate::wire::ChatCompletionRequest;

/// CORS headers sent on model listings and preflight responses.
const CORS_HEADERS: [(HeaderName, &str); 4] = [
    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
    (header::ACCESS_CONTROL_ALLOW_METHODS, "*"),
    (header::ACCESS_CONTROL_MAX_AGE, "86400"),
];

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    chat: ChatState,
    gate: AccessGate,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Completion and model routes sit behind the access gate; health and
/// metrics do not. A concurrency limit layer caps simultaneous requests at
/// `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let api = Router::new()
        .route("/models", get(models_handler))
        .route("/v1/models", get(models_handler))
        .route(
            "/chat/completions",
            post(completions_handler).options(preflight_handler),
        )
        .route(
            "/v1/chat/completions",
            post(completions_handler).options(preflight_handler),
        )
        .route_layer(middleware::from_fn_with_state(
            state.gate.clone(),
            auth::require_access,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(api)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting chat-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let models = ModelRegistry::from_config(config.bot.as_ref());
    let pool = Arc::new(Pool::new(
        std::mem::take(&mut config.pool.tokens),
        config.pool.max_concurrency,
        config.cool_down(),
    ));
    let gate = AccessGate::new(std::mem::take(&mut config.access_tokens));

    info!(
        listen_addr = %config.server.listen_addr,
        gateway_url = %config.upstream.gateway_url,
        sessions = pool.size(),
        max_concurrency = config.pool.max_concurrency,
        cool_down_secs = config.pool.cool_down_secs,
        idle_timeout_secs = config.upstream.idle_timeout_secs,
        models = models.len(),
        access_gate = gate.is_enabled(),
        "configuration loaded"
    );

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;
    let adapter: Arc<dyn SessionAdapter> = Arc::new(HttpGatewayAdapter::new(
        client,
        &config.upstream.gateway_url,
        config.role_simulation(),
        config.request_timeout(),
    ));

    let metrics = ServiceMetrics::new();
    let app_state = AppState {
        chat: ChatState {
            pool,
            adapter,
            models: Arc::new(models),
            idle_timeout: config.idle_timeout(),
        },
        gate,
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Clone in_flight counter for drain observability after shutdown
    let in_flight = metrics.in_flight.clone();

    // The drain timeout starts when the shutdown signal fires: the server is
    // told to drain, then raced against DRAIN_TIMEOUT.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: pool snapshot plus uptime and request counters.
/// Returns 503 while no session can be leased.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.chat.pool.health();
    let status_code = if pool["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = serde_json::json!({
        "status": pool["status"],
        "uptime_seconds": state.metrics.started_at.elapsed().as_secs(),
        "requests_served": state.metrics.requests_total.load(Ordering::Relaxed),
        "errors_total": state.metrics.errors_total.load(Ordering::Relaxed),
        "in_flight": state.metrics.in_flight.load(Ordering::Relaxed),
        "pool": pool,
    });

    (
        status_code,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn models_handler(State(state): State<AppState>) -> impl IntoResponse {
    (CORS_HEADERS, Json(state.chat.models.list()))
}

async fn preflight_handler() -> impl IntoResponse {
    (CORS_HEADERS, Json(""))
}

async fn completions_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let started = Instant::now();
    let in_flight = state.metrics.begin_request();

    let (mode, outcome) = match payload {
        Ok(Json(request)) => {
            let mode = if request.stream { "stream" } else { "blocking" };
            let outcome = completions::chat_completions(&state.chat, request, &request_id).await;
            (mode, outcome)
        }
        Err(rejection) => (
            "unknown",
            Err(GatewayError::Validation(format!(
                "invalid request body: {}",
                rejection.body_text()
            ))),
        ),
    };

    let response = match outcome {
        Ok(response) => response,
        Err(err) => {
            state.metrics.record_error();
            warn!(request_id = %request_id, error = %err, "completion request failed");
            err.to_response(&request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        mode,
        started.elapsed().as_secs_f64(),
    );

    if mode == "stream" && response.status().is_success() {
        hold_until_sent(response, in_flight)
    } else {
        response
    }
}

/// Keep a request counted as in flight until its body is fully sent or
/// dropped.
fn hold_until_sent(response: Response, in_flight: InFlight) -> Response {
    let (parts, body) = response.into_parts();
    let body = body.into_data_stream().map(move |chunk| {
        let _held = &in_flight;
        chunk
    });
    Response::from_parts(parts, Body::from_stream(body))
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
