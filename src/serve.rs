//! Purpose: Host the prediction function over HTTP.
//! Exports: `ServeConfig`, `serve`, `validate_config`.
//! Role: Axum server standing in for the function runtime; one script run per request.
//! Invariants: The function route accepts any method; replies are JSON with 200 or 500.
//! Invariants: Router state is immutable and shared; requests never see each other's data.
//! Notes: Bodies above `max_body_bytes` are rejected with 413 before a script is started.

use axum::extract::{DefaultBodyLimit, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use predictcrop::api::{
    Error, ErrorKind, ProcessRunner, Reply, ScriptRunner, handle, request_payload,
    validate_script_settings,
};

pub const FUNCTION_ROUTE: &str = "/predictCrop";

#[derive(Clone, Debug, Serialize)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub command: String,
    pub timeout_ms: u64,
    pub max_body_bytes: u64,
    pub max_output_bytes: u64,
}

struct AppState<R> {
    runner: R,
    timeout: Duration,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let max_body_bytes: usize = config
        .max_body_bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("--max-body-bytes is too large"))?;

    let runner = ProcessRunner::new(config.command.clone())
        .with_max_output_bytes(config.max_output_bytes);
    tracing::debug!(
        command = %runner.command(),
        max_output_bytes = runner.max_output_bytes(),
        "script runner configured"
    );
    let app = router(runner, Duration::from_millis(config.timeout_ms), max_body_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    tracing::info!(
        bind = %config.bind,
        command = %config.command,
        timeout_ms = config.timeout_ms,
        "serving prediction function"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

fn router<R: ScriptRunner>(runner: R, timeout: Duration, max_body_bytes: usize) -> Router {
    let state = Arc::new(AppState { runner, timeout });
    Router::new()
        .route("/", any(predict::<R>))
        .route(FUNCTION_ROUTE, any(predict::<R>))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    validate_script_settings(&config.command, config.timeout_ms, config.max_output_bytes)?;

    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes must be greater than zero")
            .with_hint("Use a positive value like 1048576."));
    }

    if config.max_body_bytes > usize::MAX as u64 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes exceeds platform limits")
            .with_hint("Use a smaller value that fits in memory."));
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

async fn healthz() -> Response {
    Json(json!({ "ok": true })).into_response()
}

async fn predict<R: ScriptRunner>(State(state): State<Arc<AppState<R>>>, body: Bytes) -> Response {
    let payload = request_payload(&body);
    let reply = handle(&state.runner, &payload, state.timeout).await;
    reply_response(reply)
}

fn reply_response(reply: Reply) -> Response {
    (reply.status_code(), Json(reply.into_body())).into_response()
}
