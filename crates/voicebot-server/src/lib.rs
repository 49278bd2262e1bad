use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tracing::info;
use voicebot_config::Config;
use voicebot_contracts::{ErrorBody, ErrorResponse, EventReport, ProtocolEvent};

pub mod adapter;
pub mod engine;
pub mod registry;
pub mod roster;
pub mod runtime;
pub mod store;

pub use adapter::{ChannelAdapter, HttpAdapter, ProtocolError};
pub use engine::{Engine, EngineError, EngineInput, EngineSettings};
pub use runtime::{spawn_console, spawn_engine, spawn_sweeper, EngineHandle};
pub use store::StorageError;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let adapter: Arc<dyn ChannelAdapter> = Arc::new(HttpAdapter::new(&cfg.adapter)?);
    let engine = Engine::open(&cfg, adapter).map_err(|e| format!("startup failed: {e}"))?;
    let (handle, processor) = spawn_engine(engine);

    let every = voicebot_kernel::sweep_interval(
        cfg.bot.idle_timeout(),
        cfg.sweep.interval_secs.map(Duration::from_secs),
        Duration::from_secs(cfg.sweep.min_interval_secs),
    );
    let sweeper = spawn_sweeper(handle.clone(), every);
    if cfg.console.enabled {
        spawn_console(handle.clone()).map_err(|e| format!("console failed: {e}"))?;
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(
        %addr,
        channel = %cfg.bot.channel,
        sweep_secs = every.as_secs(),
        "listening for adapter events"
    );
    axum::serve(listener, router(handle.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))?;

    info!("shutting down");
    sweeper.abort();
    handle.shutdown().await;
    processor
        .await
        .map_err(|e| format!("engine task failed: {e}"))?;
    Ok(())
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let adapter: Arc<dyn ChannelAdapter> = Arc::new(HttpAdapter::new(&cfg.adapter)?);
    build_app_with_adapter(cfg, adapter).await
}

/// The HTTP ingress over a freshly loaded engine, with mode changes and
/// replies going to `adapter`.
pub async fn build_app_with_adapter(
    cfg: Config,
    adapter: Arc<dyn ChannelAdapter>,
) -> Result<Router, String> {
    let engine = Engine::open(&cfg, adapter)?;
    let (handle, _processor) = spawn_engine(engine);
    Ok(router(handle))
}

fn router(handle: EngineHandle) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/events", post(events))
        .with_state(AppState { engine: handle })
}

#[derive(Clone)]
struct AppState {
    engine: EngineHandle,
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn events(
    State(state): State<AppState>,
    Json(event): Json<ProtocolEvent>,
) -> Result<Json<EventReport>, (StatusCode, Json<ErrorResponse>)> {
    state
        .engine
        .submit(EngineInput::Protocol {
            event,
            received_at: Utc::now(),
        })
        .await
        .map(Json)
        .map_err(|e| {
            let (status, code) = match &e {
                EngineError::InvalidEvent(_) => (StatusCode::BAD_REQUEST, "validation_error"),
                EngineError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
                EngineError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "engine_unavailable"),
            };
            (
                status,
                Json(ErrorResponse {
                    error: ErrorBody {
                        code: code.to_string(),
                        message: e.to_string(),
                    },
                }),
            )
        })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
