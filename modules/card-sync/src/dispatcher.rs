//! Dispatcher / Processor (§4.F). Orchestrates per-notification work:
//! idempotency check, raw-event record, full-card fetch, classification,
//! conditional extraction, store writes, event finalization.
//!
//! Concurrency mirrors `start_gl_posting_consumer`: one task per in-flight
//! notification, bounded by a semaphore, with a per-`card_id` mutex so two
//! notifications for the same card never interleave their write phases.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::Instrument;

use extractor::{Extractor, ExtractionInput};
use source_client::{SourceClient, SourceClientError};
use store_adapter::{
    ActionKind, CardCurrentRow, CardMasterRow, LineItemRow, NotificationEvent, OperationKind,
    PendingStatus, PendingUpdate, Store, StoreError,
};

use crate::classifier::{classify_change, is_relevant, ChangeClass};
use crate::contracts::ParsedNotification;
use crate::metrics::Metrics;

pub struct Dispatcher {
    store: Arc<dyn Store>,
    source_client: Arc<dyn SourceClient>,
    extractor: Arc<dyn Extractor>,
    metrics: Arc<Metrics>,
    card_locks: DashMap<String, Arc<Mutex<()>>>,
    max_retries: u32,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        source_client: Arc<dyn SourceClient>,
        extractor: Arc<dyn Extractor>,
        metrics: Arc<Metrics>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            source_client,
            extractor,
            metrics,
            card_locks: DashMap::new(),
            max_retries,
        }
    }

    fn card_lock(&self, card_id: &str) -> Arc<Mutex<()>> {
        self.card_locks
            .entry(card_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn process(&self, notification: ParsedNotification) {
        let event_id = notification.event_id.clone();
        let span = tracing::info_span!("process_notification", event_id = %event_id);

        async move {
            if let Some(card_id) = notification.card_id.clone() {
                let lock = self.card_lock(&card_id);
                let _guard = lock.lock().await;
                self.process_locked(notification).await;
            } else {
                self.process_locked(notification).await;
            }
        }
        .instrument(span)
        .await;
    }

    async fn process_locked(&self, notification: ParsedNotification) {
        let started = Instant::now();

        match self.store.event_exists(&notification.event_id).await {
            Ok(true) => {
                tracing::info!(event_id = %notification.event_id, "duplicate notification dropped");
                self.metrics
                    .events_processed_total
                    .with_label_values(&["duplicate", "dropped"])
                    .inc();
                return;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(event_id = %notification.event_id, error = %e, "event_exists check failed");
                return;
            }
        }

        let is_list_transition = NotificationEvent::compute_is_list_transition(
            &notification.list_before_id,
            &notification.list_after_id,
        );

        let event = NotificationEvent {
            event_id: notification.event_id.clone(),
            action_kind: notification.action_kind,
            action_time: notification.action_time,
            card_id: notification.card_id.clone(),
            board_id: notification.board_id.clone(),
            board_name: notification.board_name.clone(),
            list_before_id: notification.list_before_id.clone(),
            list_before_name: notification.list_before_name.clone(),
            list_after_id: notification.list_after_id.clone(),
            list_after_name: notification.list_after_name.clone(),
            is_list_transition,
            actor_id: notification.actor_id.clone(),
            actor_name: notification.actor_name.clone(),
            raw_payload: notification.raw_payload.clone(),
            processed: false,
            processed_at: None,
            extraction_triggered: false,
            error_message: None,
            created_at: Utc::now(),
        };

        if let Err(e) = self.store.insert_event(&event).await {
            tracing::error!(event_id = %event.event_id, error = %e, "insert_event failed");
            return;
        }

        if !is_relevant(notification.action_kind, &notification.card_id) {
            self.finalize(&event.event_id, true, false, None).await;
            self.metrics
                .events_processed_total
                .with_label_values(&["irrelevant", "success"])
                .inc();
            return;
        }

        let card_id = notification.card_id.expect("checked by is_relevant");

        let card = match self.source_client.fetch_card(&card_id).await {
            Ok(card) => card,
            Err(SourceClientError::CardAbsent(_)) => {
                self.finalize(&event.event_id, false, false, Some("card_absent"))
                    .await;
                self.metrics
                    .events_processed_total
                    .with_label_values(&["card_absent", "failed"])
                    .inc();
                return;
            }
            Err(e) => {
                self.finalize(&event.event_id, false, false, Some(&e.to_string()))
                    .await;
                self.metrics
                    .events_processed_total
                    .with_label_values(&["fetch_error", "failed"])
                    .inc();
                return;
            }
        };

        let master_exists = match self.store.card_master_exists(&card_id).await {
            Ok(v) => v,
            Err(e) => {
                self.finalize(&event.event_id, false, false, Some(&e.to_string()))
                    .await;
                return;
            }
        };
        let previous_description = match self.store.get_last_known_description(&card_id).await {
            Ok(v) => v,
            Err(e) => {
                self.finalize(&event.event_id, false, false, Some(&e.to_string()))
                    .await;
                return;
            }
        };

        let class = classify_change(master_exists, previous_description.as_deref(), &card.desc);

        let outcome = self
            .apply_writes(&event.event_id, &card_id, &card, class, notification.action_kind)
            .await;

        let class_label = match class {
            ChangeClass::New => "new",
            ChangeClass::DescChanged => "desc_changed",
            ChangeClass::MetadataOnly => "metadata_only",
        };

        match outcome {
            WriteOutcome::Completed { triggered_extraction } => {
                self.finalize(&event.event_id, true, triggered_extraction, None)
                    .await;
                self.metrics
                    .events_processed_total
                    .with_label_values(&[class_label, "success"])
                    .inc();
            }
            WriteOutcome::Deferred => {
                // Event stays `processed=false`; the retry worker drives the
                // queued operations and finalizes once they all land.
                self.metrics
                    .events_processed_total
                    .with_label_values(&[class_label, "deferred"])
                    .inc();
            }
            WriteOutcome::PermanentFailure { message } => {
                self.finalize(&event.event_id, false, false, Some(&message))
                    .await;
                self.metrics
                    .events_processed_total
                    .with_label_values(&[class_label, "failed"])
                    .inc();
            }
        }

        self.metrics
            .dispatch_duration_seconds
            .with_label_values(&[class_label])
            .observe(started.elapsed().as_secs_f64());
    }

    async fn finalize(
        &self,
        event_id: &str,
        success: bool,
        triggered_extraction: bool,
        error_message: Option<&str>,
    ) {
        match self
            .store
            .finalize_event(event_id, success, triggered_extraction, error_message)
            .await
        {
            Ok(()) => {}
            Err(StoreError::Deferred(_)) => {
                let op = finalize_pending(event_id, success, triggered_extraction, error_message, Vec::new());
                if let Err(e) = self.store.enqueue_pending(op).await {
                    tracing::error!(event_id, error = %e, "failed to enqueue deferred finalize_event");
                }
            }
            Err(e) => {
                tracing::error!(event_id, error = %e, "finalize_event failed permanently");
            }
        }
    }

    async fn apply_writes(
        &self,
        event_id: &str,
        card_id: &str,
        card: &source_client::Card,
        class: ChangeClass,
        action_kind: ActionKind,
    ) -> WriteOutcome {
        let mut deferred = Vec::new();
        let mut triggered_extraction = false;
        let mut carried_extraction: Option<(
            Option<chrono::DateTime<Utc>>,
            Option<String>,
        )> = None;

        let (fields, line_items, line_item_count) = match class {
            ChangeClass::New | ChangeClass::DescChanged => {
                triggered_extraction = true;
                let input = ExtractionInput {
                    card_id: card_id.to_string(),
                    name: card.name.clone(),
                    description: card.desc.clone(),
                };
                match self.extractor.extract(&input).await {
                    Ok(output) => {
                        self.metrics
                            .extraction_invocations_total
                            .with_label_values(&["success"])
                            .inc();
                        let count = output.line_items.len() as u32;
                        (output.fields, output.line_items, count)
                    }
                    Err(e) => {
                        self.metrics
                            .extraction_invocations_total
                            .with_label_values(&["failed"])
                            .inc();
                        return WriteOutcome::PermanentFailure {
                            message: format!("extraction_failed: {e}"),
                        };
                    }
                }
            }
            ChangeClass::MetadataOnly => {
                let previous = match self.store.get_card_current(card_id).await {
                    Ok(Some(row)) => row,
                    Ok(None) => {
                        return WriteOutcome::PermanentFailure {
                            message: "metadata_only classification with no current row".into(),
                        }
                    }
                    Err(e) => return WriteOutcome::PermanentFailure { message: e.to_string() },
                };
                carried_extraction = Some((previous.last_extracted_at, previous.last_extraction_event_id.clone()));
                (previous.extracted, Vec::new(), previous.line_item_count)
            }
        };

        if matches!(class, ChangeClass::New) {
            let master_row = CardMasterRow {
                card_id: card_id.to_string(),
                name: card.name.clone(),
                description: card.desc.clone(),
                labels: card.label_names(),
                closed: card.closed,
                board_id: card.board_id.clone(),
                board_name: card.board_name.clone(),
                list_id: card.list_id.clone(),
                list_name: card.list_name.clone(),
                extracted: fields.clone(),
                created_date: card.date_last_activity.unwrap_or_else(Utc::now),
                line_item_count,
                first_extracted_at: Some(Utc::now()),
                first_extraction_event_id: Some(event_id.to_string()),
            };
            if let Err(e) = self.store.insert_card_master_if_absent(&master_row).await {
                return WriteOutcome::PermanentFailure {
                    message: format!("insert_card_master_if_absent: {e}"),
                };
            }
            if let Err(e) = self
                .store
                .insert_line_items_master(card_id, &line_items)
                .await
            {
                return WriteOutcome::PermanentFailure {
                    message: format!("insert_line_items_master: {e}"),
                };
            }
        }

        let now = Utc::now();
        let (last_extracted_at, last_extraction_event_id) = match carried_extraction {
            Some((at, event)) => (at, event),
            None if triggered_extraction => (Some(now), Some(event_id.to_string())),
            None => (None, None),
        };
        let current_row = CardCurrentRow {
            card_id: card_id.to_string(),
            name: card.name.clone(),
            description: card.desc.clone(),
            labels: card.label_names(),
            closed: card.closed,
            board_id: card.board_id.clone(),
            board_name: card.board_name.clone(),
            list_id: card.list_id.clone(),
            list_name: card.list_name.clone(),
            extracted: fields,
            created_date: card.date_last_activity.unwrap_or(now),
            line_item_count,
            last_updated_at: now,
            last_extracted_at,
            last_extraction_event_id,
            last_event_type: action_kind,
        };

        match self.store.upsert_card_current(&current_row).await {
            Ok(()) => {}
            Err(StoreError::Deferred(msg)) => {
                self.metrics
                    .store_deferred_total
                    .with_label_values(&["upsert_card"])
                    .inc();
                deferred.push(pending_for_upsert(&current_row, &msg));
            }
            Err(e) => {
                return WriteOutcome::PermanentFailure {
                    message: format!("upsert_card_current: {e}"),
                }
            }
        }

        if matches!(class, ChangeClass::New | ChangeClass::DescChanged) {
            match self
                .store
                .replace_line_items_current(card_id, &line_items)
                .await
            {
                Ok(()) => {}
                Err(StoreError::Deferred(msg)) => {
                    self.metrics
                        .store_deferred_total
                        .with_label_values(&["replace_line_items"])
                        .inc();
                    deferred.push(pending_for_line_items(card_id, &line_items, &msg));
                }
                Err(e) => {
                    return WriteOutcome::PermanentFailure {
                        message: format!("replace_line_items_current: {e}"),
                    }
                }
            }
        }

        if !deferred.is_empty() {
            let dependency_ids: Vec<String> = deferred.iter().map(|op| op.update_id.clone()).collect();
            deferred.push(finalize_pending(
                event_id,
                true,
                triggered_extraction,
                None,
                dependency_ids,
            ));
            for op in deferred {
                if let Err(e) = self.store.enqueue_pending(op).await {
                    tracing::error!(event_id, error = %e, "failed to enqueue pending update");
                }
            }
            return WriteOutcome::Deferred;
        }

        WriteOutcome::Completed { triggered_extraction }
    }
}

enum WriteOutcome {
    Completed { triggered_extraction: bool },
    Deferred,
    PermanentFailure { message: String },
}

fn pending_for_upsert(row: &CardCurrentRow, error: &str) -> PendingUpdate {
    let now = Utc::now();
    PendingUpdate {
        update_id: uuid::Uuid::new_v4().to_string(),
        operation_kind: OperationKind::UpsertCard,
        target_table: "card_current".to_string(),
        payload: serde_json::to_value(row).unwrap_or(serde_json::Value::Null),
        retry_count: 0,
        first_queued_at: now,
        last_retry_at: None,
        next_retry_at: now,
        status: PendingStatus::Pending,
        error_message: Some(error.to_string()),
        completed_at: None,
        created_at: now,
        depends_on: Vec::new(),
    }
}

fn pending_for_line_items(card_id: &str, rows: &[LineItemRow], error: &str) -> PendingUpdate {
    let now = Utc::now();
    PendingUpdate {
        update_id: uuid::Uuid::new_v4().to_string(),
        operation_kind: OperationKind::ReplaceLineItems,
        target_table: "line_items_current".to_string(),
        payload: serde_json::json!({ "card_id": card_id, "rows": rows }),
        retry_count: 0,
        first_queued_at: now,
        last_retry_at: None,
        next_retry_at: now,
        status: PendingStatus::Pending,
        error_message: Some(error.to_string()),
        completed_at: None,
        created_at: now,
        depends_on: Vec::new(),
    }
}

fn finalize_pending(
    event_id: &str,
    success: bool,
    triggered_extraction: bool,
    error_message: Option<&str>,
    depends_on: Vec<String>,
) -> PendingUpdate {
    let now = Utc::now();
    PendingUpdate {
        update_id: uuid::Uuid::new_v4().to_string(),
        operation_kind: OperationKind::FinalizeEvent,
        target_table: "events".to_string(),
        payload: serde_json::json!({
            "event_id": event_id,
            "success": success,
            "triggered_extraction": triggered_extraction,
            "error_message": error_message,
        }),
        retry_count: 0,
        // Queued after the dependent writes above, so a single retry
        // worker processing claims in `first_queued_at` order retries them
        // first (§4.G design note on ordering). `depends_on` is the real
        // gate: the retry worker re-defers this row on any tick where a
        // dependency hasn't reached `completed`, regardless of ordering.
        first_queued_at: now + chrono::Duration::milliseconds(1),
        last_retry_at: None,
        next_retry_at: now + chrono::Duration::milliseconds(1),
        status: PendingStatus::Pending,
        error_message: None,
        completed_at: None,
        created_at: now,
        depends_on,
    }
}

/// Spawns the bounded worker pool that drains the intake channel. The
/// returned handle resolves only once the channel has closed *and* every
/// in-flight `process` call it spawned has finished, so callers can await it
/// as a genuine drain signal during shutdown.
pub fn spawn_workers(
    dispatcher: Arc<Dispatcher>,
    mut rx: mpsc::Receiver<ParsedNotification>,
    worker_count: usize,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(worker_count));
        let mut in_flight = tokio::task::JoinSet::new();
        while let Some(notification) = rx.recv().await {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore open");
            let dispatcher = dispatcher.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                dispatcher.process(notification).await;
            });
        }
        tracing::info!("dispatcher intake channel closed, draining in-flight work");
        while in_flight.join_next().await.is_some() {}
        tracing::info!("dispatcher worker pool drained");
    })
}

