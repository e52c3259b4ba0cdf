//! Thin HTTP entry point.
//!
//! One webhook route delegating to the orchestrator plus a liveness probe.
//! Accepted events return immediately; the run executes on a spawned task
//! so runs from distinct deliveries proceed in parallel.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::orchestrator::Orchestrator;
use crate::signature;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub webhook_secret: String,
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/", post(webhook))
        .route("/webhook/test", get(webhook_test))
        .with_state(state)
}

/// `POST /webhook/`: verify, acknowledge, dispatch in the background.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if signature::verify(&state.webhook_secret, &body, signature_header).is_err() {
        tracing::warn!("webhook signature verification failed");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"message": "Invalid signature"})),
        );
    }

    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    tracing::info!(event, "received webhook event");

    match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(payload) => {
            let orchestrator = state.orchestrator.clone();
            tokio::spawn(async move {
                if let Err(e) = orchestrator.handle_event(&event, &payload).await {
                    tracing::error!(event, error = %e, "webhook handler failed");
                }
            });
        }
        Err(e) => {
            tracing::warn!(error = %e, "ignoring unparseable webhook payload");
        }
    }

    (StatusCode::OK, Json(json!({"message": "Event received"})))
}

/// `GET /webhook/test`: liveness.
async fn webhook_test() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"message": "Webhook is working!"})))
}
