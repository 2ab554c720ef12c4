//! Purpose: Turn one function request into one script invocation and one reply.
//! Exports: `handle`, `request_payload`, `Reply`, `FailureCause`, `INVALID_RESPONSE_MESSAGE`.
//! Role: The request adapter shared by the HTTP server and the `invoke` command.
//! Invariants: Exactly one `ScriptRunner::invoke` per `handle` call; nothing is cached or retried.
//! Invariants: Failure causes are checked in order: invocation, stderr, unparsable stdout.
//! Invariants: Unparsable stdout is always masked behind `INVALID_RESPONSE_MESSAGE`.

use std::time::{Duration, Instant};

use axum::http::StatusCode;
use serde_json::{Map, Value, json};

use super::runner::ScriptRunner;

pub const INVALID_RESPONSE_MESSAGE: &str = "Invalid response from Python script";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureCause {
    /// The script could not start, crashed, or ran out of time or output budget.
    Invocation,
    /// The script wrote to stderr.
    Reported,
    /// The script's stdout was not JSON.
    Malformed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Prediction(Value),
    Failure { cause: FailureCause, message: String },
}

impl Reply {
    fn failure(cause: FailureCause, message: impl Into<String>) -> Self {
        Reply::Failure {
            cause,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Reply::Prediction(_) => StatusCode::OK,
            Reply::Failure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_body(self) -> Value {
        match self {
            Reply::Prediction(value) => value,
            Reply::Failure { message, .. } => json!({ "error": message }),
        }
    }
}

/// Decodes a raw request body the way the function runtime presents it.
///
/// Empty bodies become `{}`, JSON bodies are taken as-is, and anything else is
/// passed along as a JSON string.
pub fn request_payload(body: &[u8]) -> Value {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Object(Map::new());
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

pub async fn handle<R: ScriptRunner>(runner: &R, payload: &Value, timeout: Duration) -> Reply {
    let started = Instant::now();
    let input = match serde_json::to_vec(payload) {
        Ok(input) => input,
        Err(err) => {
            tracing::warn!(error = %err, "failed to encode request payload");
            return Reply::failure(FailureCause::Invocation, "failed to encode request payload");
        }
    };

    let reply = match runner.invoke(input, timeout).await {
        Err(err) => {
            if !err.kind().is_invocation_failure() {
                // Pipe or wait errors on our side, not a verdict on the script.
                tracing::error!(error = %err, "script relay failed");
            }
            Reply::failure(FailureCause::Invocation, err.describe())
        }
        Ok(captured) if !captured.stderr.is_empty() => Reply::failure(
            FailureCause::Reported,
            String::from_utf8_lossy(&captured.stderr).into_owned(),
        ),
        Ok(captured) => match serde_json::from_slice::<Value>(&captured.stdout) {
            Ok(value) => Reply::Prediction(value),
            Err(err) => {
                tracing::debug!(error = %err, bytes = captured.stdout.len(), "script stdout is not JSON");
                Reply::failure(FailureCause::Malformed, INVALID_RESPONSE_MESSAGE)
            }
        },
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &reply {
        Reply::Prediction(_) => tracing::debug!(elapsed_ms, "prediction succeeded"),
        Reply::Failure { cause, message } => {
            tracing::warn!(?cause, elapsed_ms, %message, "prediction failed")
        }
    }
    reply
}
