use axum::extract::State;
use axum::{response::IntoResponse, Json};
use std::sync::Arc;

use crate::metrics::Metrics;

/// `GET /healthz` — process-level liveness only. Downstream collaborators
/// (the analytical store, the source platform, the extractor) are not
/// probed here; their health shows up as retry-queue depth instead.
pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "card-sync",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn metrics(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        metrics.render(),
    )
}
