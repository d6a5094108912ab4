//! HTTP-level coverage of Event Intake (§4.E): signature verification,
//! immediate acknowledgment, and channel-full backpressure.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use card_sync::intake::{router, IntakeState};
use card_sync::metrics::Metrics;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::mpsc;
use tower::ServiceExt;

const SECRET: &str = "test-secret";
const CALLBACK_URL: &str = "https://card-sync.example.com/webhooks/source";

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(body);
    mac.update(CALLBACK_URL.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn app(tx: mpsc::Sender<card_sync::contracts::ParsedNotification>) -> axum::Router {
    let state = Arc::new(IntakeState {
        tx,
        webhook_secret: SECRET.to_string(),
        callback_url: CALLBACK_URL.to_string(),
        metrics: Arc::new(Metrics::new()),
    });
    router(state)
}

fn notification_body() -> Vec<u8> {
    serde_json::json!({
        "action": {
            "id": "E1",
            "type": "createCard",
            "date": "2026-07-28T12:00:00.000Z",
            "data": { "card": { "id": "C1" } },
        }
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn liveness_probe_is_a_bare_ok() {
    let (tx, _rx) = mpsc::channel(1);
    let response = app(tx)
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/webhooks/source")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn well_signed_notification_is_acked_and_forwarded() {
    let (tx, mut rx) = mpsc::channel(4);
    let body = notification_body();
    let signature = sign(&body);

    let response = app(tx)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/source")
                .header("x-source-signature", signature)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let notification = rx.try_recv().expect("notification forwarded to dispatcher");
    assert_eq!(notification.event_id, "E1");
}

#[tokio::test]
async fn bad_signature_is_rejected_before_parsing() {
    let (tx, mut rx) = mpsc::channel(4);
    let body = notification_body();

    let response = app(tx)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/source")
                .header("x-source-signature", "not-the-right-signature")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn malformed_json_is_rejected_with_400() {
    let (tx, mut rx) = mpsc::channel(4);
    let body = b"not json".to_vec();
    let signature = sign(&body);

    let response = app(tx)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/source")
                .header("x-source-signature", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn payload_missing_required_fields_is_rejected_with_400() {
    let (tx, mut rx) = mpsc::channel(4);
    // Well-formed JSON, but missing `action.id` — `malformed_payload` in the
    // error taxonomy, not a transport-level parse failure.
    let body = serde_json::json!({
        "action": { "type": "createCard", "date": "2026-07-28T12:00:00.000Z" }
    })
    .to_string()
    .into_bytes();
    let signature = sign(&body);

    let response = app(tx)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/source")
                .header("x-source-signature", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn full_dispatcher_channel_still_acks_and_is_recorded_as_overflow() {
    let (tx, _rx) = mpsc::channel(1);
    // Fill the only slot so the next send sees a full channel.
    let filler = card_sync::contracts::parse_notification(serde_json::json!({
        "action": { "id": "filler", "type": "createCard", "date": "2026-07-28T12:00:00.000Z" }
    }))
    .unwrap();
    tx.try_send(filler).unwrap();

    let body = notification_body();
    let signature = sign(&body);

    let response = app(tx)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/source")
                .header("x-source-signature", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    // Acked regardless of backpressure; the source platform never sees a
    // failure it would otherwise retry into a duplicate-prone resend storm.
    assert_eq!(response.status(), StatusCode::OK);
    let _ = to_bytes(response.into_body(), usize::MAX).await.unwrap();
}
