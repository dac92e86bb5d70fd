//! HTTP API handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::debug;

use crate::error::AegisError;
use crate::intent::IntentTracker;
use crate::pipeline::{Outcome, Stage};
use crate::AppState;

const MAX_PROMPT_LEN: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;

static REQUESTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static BLOCKED_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Auth middleware: checks Bearer token if AEGIS_API_KEY is configured.
async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AegisError> {
    let Some(ref expected) = state.api_key else {
        return Ok(next.run(req).await);
    };

    let unauthorized = || AegisError::Unauthorized;

    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(unauthorized)?;

    let token = header.strip_prefix("Bearer ").ok_or_else(unauthorized)?;

    // constant-time comparison to prevent timing attacks
    if token.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(next.run(req).await)
    } else {
        Err(unauthorized())
    }
}

pub fn router(state: AppState) -> Router {
    // Public routes (no auth)
    let public = Router::new()
        .route("/", get(health))
        .route("/stats", get(stats));

    // Protected routes
    let protected = Router::new()
        .route("/chat", post(chat))
        .route("/reset", post(reset))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    public.merge(protected).with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "aegis",
        "version": env!("CARGO_PKG_VERSION"),
        "antibodies": state.membrane.antibody_count(),
        "hardening_updates": state.hardening.updates(),
    }))
}

async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "antibodies": state.membrane.antibody_count(),
        "hardening_updates": state.hardening.updates(),
        "requests_total": REQUESTS_TOTAL.load(Ordering::Relaxed),
        "blocked_total": BLOCKED_TOTAL.load(Ordering::Relaxed),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

#[derive(Deserialize)]
struct ChatRequest {
    #[serde(default)]
    conversation: Option<String>,
    #[serde(default)]
    prompt: String,
}

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AegisError> {
    if req.prompt.trim().is_empty() {
        return Err(AegisError::EmptyPrompt);
    }
    if req.prompt.len() > MAX_PROMPT_LEN {
        return Err(AegisError::PromptTooLong);
    }
    REQUESTS_TOTAL.fetch_add(1, Ordering::Relaxed);

    let conversation = req.conversation.unwrap_or_else(|| "default".into());
    let tracker = state.tracker_for(&conversation);

    // Turns within one conversation serialize here; other conversations
    // proceed in parallel.
    let mut guard = tracker.lock().await;
    let output = state.pipeline.process(&mut guard, &req.prompt).await;
    drop(guard);

    let result = output.result;
    if matches!(result.stage, Stage::BlockedL1 | Stage::BlockedL2) {
        BLOCKED_TOTAL.fetch_add(1, Ordering::Relaxed);
    }
    debug!(conversation = %conversation, stage = ?result.stage, latency_ms = result.latency_ms, "chat handled");

    match output.outcome {
        Outcome::Message(message) => {
            let body = serde_json::json!({ "result": result, "response": message });
            Ok(Json(body).into_response())
        }
        Outcome::Stream(stream) => {
            // The pipeline already terminated; from here the client paces
            // the downstream chunks.
            let byte_stream = stream.map(|chunk| {
                chunk.map(axum::body::Bytes::from).map_err(std::io::Error::other)
            });
            let response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .header("x-aegis-stage", "SUCCESS")
                .header("x-aegis-l1-similarity", result.l1_similarity.to_string())
                .header("x-aegis-l2-score", result.l2_score.to_string())
                .header("x-aegis-skipped-l2", result.skipped_l2.to_string())
                .body(Body::from_stream(byte_stream))
                .map_err(|e| AegisError::Internal(e.to_string()))?;
            Ok(response)
        }
    }
}

#[derive(Deserialize)]
struct ResetRequest {
    #[serde(default)]
    conversation: Option<String>,
}

/// Clear one conversation's intent history. The antibody store keeps
/// everything it has learned.
async fn reset(
    State(state): State<AppState>,
    Json(req): Json<ResetRequest>,
) -> Json<serde_json::Value> {
    let conversation = req.conversation.unwrap_or_else(|| "default".into());
    let tracker: Option<Arc<tokio::sync::Mutex<IntentTracker>>> =
        state.conversations.lock().get(&conversation).cloned();

    let cleared = match tracker {
        Some(t) => {
            t.lock().await.reset();
            true
        }
        None => false,
    };

    Json(serde_json::json!({ "conversation": conversation, "reset": cleared }))
}
