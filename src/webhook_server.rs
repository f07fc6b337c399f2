// HTTP webhook server for provider settlement events

use crate::stripe::webhook::WebhookProcessor;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct WebhookState {
    pub processor: Arc<WebhookProcessor>,
    pub webhook_secret: String,
    pub tolerance_seconds: i64,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/health", get(health_check))
        .with_state(state)
}

pub async fn run_webhook_server(
    port: u16,
    processor: Arc<WebhookProcessor>,
    webhook_secret: String,
    tolerance_seconds: i64,
) -> anyhow::Result<()> {
    let app = router(WebhookState {
        processor,
        webhook_secret,
        tolerance_seconds,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting webhook HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn handle_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    match state
        .processor
        .process(&body, &headers, &state.webhook_secret, state.tolerance_seconds)
        .await
    {
        Ok(outcome) => {
            if !outcome.success {
                // Receipt is still acknowledged so the provider does not
                // enter a redelivery storm; the failure is escalated
                // out-of-band for manual reconciliation.
                error!(
                    event_id = %outcome.event_id,
                    event_type = %outcome.event_type,
                    message = ?outcome.message,
                    "Webhook handled with soft failure"
                );
            }
            (StatusCode::OK, "OK".to_string())
        }
        Err(e) => {
            error!("Webhook rejected: {}", e);
            let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
            (status, e.to_string())
        }
    }
}
