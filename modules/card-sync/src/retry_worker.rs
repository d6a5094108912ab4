//! Retry Worker (§4.G). Every tick, claims due pending entries and
//! re-applies the failed store operation, sequentially within the batch so
//! a `finalize_event` entry queued after its dependent writes is retried
//! after them (see the ordering note in `dispatcher::finalize_pending`).
//! `depends_on` is the real guarantee: a `finalize_event` entry is re-
//! deferred, not applied, on any tick where a named dependency has not yet
//! reached `completed` — the queue ordering only decides which gets *tried*
//! first within a tick, not whether finalize is allowed to run ahead.

use std::sync::Arc;

use chrono::Utc;
use store_adapter::{CardCurrentRow, OperationKind, PendingOutcome, PendingStatus, PendingUpdate, Store};

use crate::metrics::Metrics;

pub struct RetryWorkerConfig {
    pub tick: std::time::Duration,
    pub batch_size: usize,
    pub max_retries: u32,
}

pub async fn run(store: Arc<dyn Store>, metrics: Arc<Metrics>, config: RetryWorkerConfig) {
    let mut interval = tokio::time::interval(config.tick);
    loop {
        interval.tick().await;
        if let Err(e) = run_once(&store, &metrics, &config).await {
            tracing::error!(error = %e, "retry worker tick failed");
        }
    }
}

/// Runs a single claim-and-retry pass. Public so operational tooling and
/// tests can drive one tick deterministically instead of waiting on the
/// `tick` interval in [`run`].
pub async fn run_once(
    store: &Arc<dyn Store>,
    metrics: &Arc<Metrics>,
    config: &RetryWorkerConfig,
) -> Result<(), store_adapter::StoreError> {
    let claimed = store.claim_pending(config.batch_size, Utc::now()).await?;
    if claimed.is_empty() {
        return Ok(());
    }
    tracing::info!(count = claimed.len(), "retry worker claimed pending updates");

    for op in claimed {
        attempt_one(store, metrics, config.max_retries, op).await;
    }
    Ok(())
}

async fn attempt_one(
    store: &Arc<dyn Store>,
    metrics: &Arc<Metrics>,
    max_retries: u32,
    op: PendingUpdate,
) {
    let span = tracing::info_span!(
        "retry_pending_update",
        update_id = %op.update_id,
        operation_kind = ?op.operation_kind,
        retry_count = op.retry_count,
    );
    let _enter = span.enter();

    if !op.depends_on.is_empty() {
        match dependencies_completed(store, &op.depends_on).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!("finalize_event waiting on dependent pending updates; deferring");
                if let Err(e) = store
                    .complete_pending(
                        &op.update_id,
                        PendingOutcome::Failed,
                        Some("waiting on dependent pending updates"),
                        max_retries,
                    )
                    .await
                {
                    tracing::error!(error = %e, "failed to re-defer finalize_event pending dependency wait");
                }
                metrics
                    .retry_attempts_total
                    .with_label_values(&["waiting_on_dependency"])
                    .inc();
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to check finalize_event dependencies");
                return;
            }
        }
    }

    let result = match op.operation_kind {
        OperationKind::UpsertCard => apply_upsert_card(store, &op).await,
        OperationKind::ReplaceLineItems => apply_replace_line_items(store, &op).await,
        OperationKind::FinalizeEvent => apply_finalize_event(store, &op).await,
    };

    match result {
        Ok(()) => {
            if let Err(e) = store
                .complete_pending(&op.update_id, PendingOutcome::Succeeded, None, max_retries)
                .await
            {
                tracing::error!(error = %e, "failed to mark pending update completed");
            }
            metrics
                .retry_attempts_total
                .with_label_values(&["succeeded"])
                .inc();
        }
        Err(e) => {
            let terminal = op.retry_count + 1 >= max_retries;
            if terminal {
                tracing::error!(
                    error = %e,
                    "pending update exhausted retries; operator intervention required"
                );
            }
            if let Err(complete_err) = store
                .complete_pending(
                    &op.update_id,
                    PendingOutcome::Failed,
                    Some(&e.to_string()),
                    max_retries,
                )
                .await
            {
                tracing::error!(error = %complete_err, "failed to record pending update failure");
            }
            metrics
                .retry_attempts_total
                .with_label_values(&[if terminal { "failed_terminal" } else { "failed" }])
                .inc();
        }
    }
}

async fn dependencies_completed(
    store: &Arc<dyn Store>,
    depends_on: &[String],
) -> Result<bool, store_adapter::StoreError> {
    for dep_id in depends_on {
        match store.pending_update_status(dep_id).await? {
            Some(PendingStatus::Completed) | None => continue,
            Some(_) => return Ok(false),
        }
    }
    Ok(true)
}

async fn apply_upsert_card(
    store: &Arc<dyn Store>,
    op: &PendingUpdate,
) -> Result<(), store_adapter::StoreError> {
    let row: CardCurrentRow = serde_json::from_value(op.payload.clone()).map_err(|e| {
        store_adapter::StoreError::Permanent(format!("decoding upsert_card payload: {e}"))
    })?;
    store.upsert_card_current(&row).await
}

async fn apply_replace_line_items(
    store: &Arc<dyn Store>,
    op: &PendingUpdate,
) -> Result<(), store_adapter::StoreError> {
    let card_id = op
        .payload
        .get("card_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            store_adapter::StoreError::Permanent("replace_line_items payload missing card_id".into())
        })?;
    let rows = op
        .payload
        .get("rows")
        .cloned()
        .ok_or_else(|| {
            store_adapter::StoreError::Permanent("replace_line_items payload missing rows".into())
        })
        .and_then(|v| {
            serde_json::from_value(v).map_err(|e| {
                store_adapter::StoreError::Permanent(format!("decoding line item rows: {e}"))
            })
        })?;
    store.replace_line_items_current(card_id, &rows).await
}

async fn apply_finalize_event(
    store: &Arc<dyn Store>,
    op: &PendingUpdate,
) -> Result<(), store_adapter::StoreError> {
    let event_id = op
        .payload
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            store_adapter::StoreError::Permanent("finalize_event payload missing event_id".into())
        })?;
    let success = op
        .payload
        .get("success")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let triggered_extraction = op
        .payload
        .get("triggered_extraction")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let error_message = op
        .payload
        .get("error_message")
        .and_then(|v| v.as_str());

    store
        .finalize_event(event_id, success, triggered_extraction, error_message)
        .await
}
