//! MedAssist API Gateway
//!
//! HTTP front end for the medical Q&A answer cache.
//! Handles:
//! - Chat and session cache routes
//! - Health and readiness probes
//! - Observability (logging, metrics, tracing)

mod handlers;

use anyhow::Context;
use axum::{
    routing::{delete, get, post},
    Router,
};
use medassist_common::{
    build_answer_cache,
    cache::AnswerCache,
    config::{AppConfig, ObservabilityConfig},
    metrics,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub cache: Arc<AnswerCache>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("failed to load configuration")?;

    init_tracing(&config.observability);

    info!(
        version = medassist_common::VERSION,
        service = %config.observability.service_name,
        "Starting MedAssist API Gateway"
    );

    init_metrics(config.observability.metrics_port)?;

    let cache = build_answer_cache(&config)
        .await
        .context("failed to build answer pipeline")?;

    if let Some(interval) = config.pipeline.sweep_interval() {
        cache.spawn_sweeper(interval);
        info!(interval_secs = interval.as_secs(), "Cache sweeper started");
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;

    let state = AppState {
        config: Arc::new(config),
        cache,
    };

    let app = create_router(state);

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing; `RUST_LOG` overrides the configured level
fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if config.json_logging {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Install the Prometheus exporter on its own port (0 disables it)
fn init_metrics(port: u16) -> anyhow::Result<()> {
    if port == 0 {
        warn!("Metrics exporter disabled");
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .set_buckets(metrics::LATENCY_BUCKETS)?
        .install()
        .context("failed to install Prometheus exporter")?;

    metrics::register_metrics();
    info!(port, "Metrics exporter listening");
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        // Chat endpoints
        .route("/chat/text", post(handlers::chat::chat_text))
        // Session endpoints
        .route("/sessions/{id}/cache", delete(handlers::sessions::clear_session_cache));

    let request_timeout = state.config.request_timeout();

    Router::new()
        .nest("/v1", api_routes)
        .layer(
            ServiceBuilder::new()
                // Request ID first so every trace carries it
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(cors)
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn test_app() -> (Router, Arc<AnswerCache>) {
        let config = AppConfig::default();
        let cache = build_answer_cache(&config).await.unwrap();
        let state = AppState {
            config: Arc::new(config),
            cache: cache.clone(),
        };
        (create_router(state), cache)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn chat(query: &str, session_id: &str) -> Request<Body> {
        Request::post("/v1/chat/text")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "query": query, "session_id": session_id }).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_app().await;
        let (status, body) = send(&app, Request::get("/v1/health").body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_chat_then_cached() {
        let (app, _) = test_app().await;

        let (status, first) = send(&app, chat("What is diabetes?", "s1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["cached"], false);
        assert!(first["response"].as_str().is_some_and(|r| !r.is_empty()));

        let (_, second) = send(&app, chat("what is DIABETES?", "s1")).await;
        assert_eq!(second["cached"], true);
        assert_eq!(second["response"], first["response"]);
    }

    #[tokio::test]
    async fn test_chat_flags_emergency() {
        let (app, _) = test_app().await;
        let (status, body) = send(&app, chat("I think I'm having a heart attack", "s1")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["emergency"], true);
    }

    #[tokio::test]
    async fn test_blank_query_rejected() {
        let (app, _) = test_app().await;
        let (status, body) = send(&app, chat("   ", "s1")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["field"], "query");
        assert_eq!(body["error"]["retryable"], false);
    }

    #[tokio::test]
    async fn test_oversized_query_rejected() {
        let (app, _) = test_app().await;
        let (status, body) = send(&app, chat(&"a".repeat(501), "s1")).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"]["code"], "QUERY_TOO_LONG");
    }

    #[tokio::test]
    async fn test_missing_session_rejected() {
        let (app, _) = test_app().await;
        let (status, body) = send(&app, chat("What is asthma?", "")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["field"], "session_id");
    }

    #[tokio::test]
    async fn test_clear_session_cache() {
        let (app, cache) = test_app().await;
        send(&app, chat("What is diabetes?", "s1")).await;
        send(&app, chat("What is asthma?", "s1")).await;

        let request = Request::delete("/v1/sessions/s1/cache").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "session_id": "s1", "removed": 2 }));
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_ready_reports_cache_stats() {
        let (app, _) = test_app().await;
        send(&app, chat("What is diabetes?", "s1")).await;

        let (status, body) = send(&app, Request::get("/v1/ready").body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["checks"]["cache"]["entries"], 1);
        assert_eq!(body["checks"]["cache"]["misses"], 1);
    }
}
