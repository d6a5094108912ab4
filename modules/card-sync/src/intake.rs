//! Event Intake (§4.E). Single URL serving both the source platform's
//! liveness probe and its notification callback. A well-formed notification
//! is acknowledged before any downstream work proceeds; backpressure past
//! that point is absorbed by an overflow log, relying on the source
//! platform's own retry behavior plus idempotency (§4.F) to bound
//! lossiness. Malformed JSON or a payload missing required fields is
//! rejected with 400 and never recorded.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::mpsc;

use crate::contracts::parse_notification;
use crate::metrics::Metrics;

type HmacSha256 = Hmac<Sha256>;

pub struct IntakeState {
    pub tx: mpsc::Sender<crate::contracts::ParsedNotification>,
    pub webhook_secret: String,
    pub callback_url: String,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: Arc<IntakeState>) -> Router {
    Router::new()
        .route("/webhooks/source", get(liveness).head(liveness).post(receive_notification))
        .with_state(state)
}

/// The source platform probes with a bodiless GET/HEAD before registering
/// the webhook; any 2xx with an empty body satisfies it.
async fn liveness() -> StatusCode {
    StatusCode::OK
}

async fn receive_notification(
    State(state): State<Arc<IntakeState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Err(e) = verify_signature(&body, &headers, &state.webhook_secret, &state.callback_url) {
        tracing::warn!(error = %e, "webhook signature verification failed");
        return StatusCode::UNAUTHORIZED;
    }

    let raw: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse notification payload");
            return StatusCode::BAD_REQUEST;
        }
    };

    let notification = match parse_notification(raw) {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(error = %e, "failed to extract required fields from notification");
            return StatusCode::BAD_REQUEST;
        }
    };

    state
        .metrics
        .events_received_total
        .with_label_values(&[action_kind_label(&notification)])
        .inc();

    match state.tx.try_send(notification) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(notification)) => {
            tracing::warn!(
                event_id = %notification.event_id,
                "dispatcher channel full; recording overflow, relying on source platform retry"
            );
            state
                .metrics
                .intake_overflow_total
                .with_label_values(&[action_kind_label(&notification)])
                .inc();
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::error!("dispatcher channel closed; dropping notification");
        }
    }

    StatusCode::OK
}

fn action_kind_label(notification: &crate::contracts::ParsedNotification) -> &'static str {
    match notification.action_kind {
        store_adapter::ActionKind::CardCreated => "card_created",
        store_adapter::ActionKind::CardUpdated => "card_updated",
        store_adapter::ActionKind::Other => "other",
    }
}

fn verify_signature(
    body: &[u8],
    headers: &HeaderMap,
    secret: &str,
    callback_url: &str,
) -> Result<(), String> {
    let signature = headers
        .get("x-source-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing signature header".to_string())?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| format!("invalid secret: {e}"))?;
    mac.update(body);
    mac.update(callback_url.as_bytes());

    let expected = hex::encode(mac.finalize().into_bytes());
    if constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips() {
        let secret = "shh";
        let callback_url = "https://example.com/webhooks/source";
        let body = br#"{"action":{"id":"A1"}}"#;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        mac.update(callback_url.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let mut headers = HeaderMap::new();
        headers.insert("x-source-signature", signature.parse().unwrap());

        assert!(verify_signature(body, &headers, secret, callback_url).is_ok());
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let callback_url = "https://example.com/webhooks/source";
        let body = br#"{"action":{"id":"A1"}}"#;

        let mut mac = HmacSha256::new_from_slice(b"right").unwrap();
        mac.update(body);
        mac.update(callback_url.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let mut headers = HeaderMap::new();
        headers.insert("x-source-signature", signature.parse().unwrap());

        assert!(verify_signature(body, &headers, "wrong", callback_url).is_err());
    }
}
