//! In-memory implementation of the `Store` trait for tests and local development.
//!
//! Mirrors the shape of `InMemoryBus` in `event-bus`: no external
//! dependencies, suitable for fast unit and integration tests that need to
//! assert on exact row contents rather than drive real BigQuery jobs.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use crate::{
    backoff::next_retry_at, CardCurrentRow, CardMasterRow, LineItemRow, MasterInsertOutcome,
    NotificationEvent, PendingOutcome, PendingStatus, PendingUpdate, Store, StoreError,
    StoreResult,
};

/// In-memory store backed by concurrent hash maps.
///
/// Each table is its own map keyed the way the real schema is keyed, so the
/// "atomic replace" semantics for line-items-current and the single-claim
/// semantics for the pending queue can be reasoned about independently of
/// the others.
#[derive(Default)]
pub struct InMemoryStore {
    events: DashMap<String, NotificationEvent>,
    events_by_card: DashMap<String, Vec<String>>,
    card_master: DashMap<String, CardMasterRow>,
    card_current: DashMap<String, CardCurrentRow>,
    line_items_master: DashMap<(String, u32), LineItemRow>,
    line_items_current: DashMap<String, Vec<LineItemRow>>,
    pending: DashMap<String, PendingUpdate>,
    update_id_seq: AtomicU64,
    /// Test-only fault injection counter; see [`InMemoryStore::fail_next_writes`].
    fault_countdown: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: generates a unique update id without relying on `uuid`
    /// randomness, so assertions on ordering stay deterministic.
    pub fn next_update_id(&self) -> String {
        let n = self.update_id_seq.fetch_add(1, Ordering::Relaxed);
        format!("pending-{n}")
    }

    pub fn card_current_row(&self, card_id: &str) -> Option<CardCurrentRow> {
        self.card_current.get(card_id).map(|r| r.clone())
    }

    pub fn card_master_row(&self, card_id: &str) -> Option<CardMasterRow> {
        self.card_master.get(card_id).map(|r| r.clone())
    }

    pub fn line_items_current_rows(&self, card_id: &str) -> Vec<LineItemRow> {
        self.line_items_current
            .get(card_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn line_items_master_rows(&self, card_id: &str) -> Vec<LineItemRow> {
        let mut rows: Vec<LineItemRow> = self
            .line_items_master
            .iter()
            .filter(|e| e.key().0 == card_id)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|r| r.line_index);
        rows
    }

    pub fn event(&self, event_id: &str) -> Option<NotificationEvent> {
        self.events.get(event_id).map(|r| r.clone())
    }

    pub fn pending_rows(&self) -> Vec<PendingUpdate> {
        self.pending.iter().map(|e| e.value().clone()).collect()
    }

    /// Test-only fault injection: the next `n` calls to a write this store
    /// treats as streaming-buffer-susceptible (`upsert_card_current`,
    /// `replace_line_items_current`) return [`StoreError::Deferred`] instead
    /// of succeeding, simulating a BigQuery streaming buffer rejection.
    pub fn fail_next_writes(&self, n: u64) {
        self.fault_countdown.store(n, Ordering::SeqCst);
    }

    fn consume_fault(&self) -> bool {
        loop {
            let current = self.fault_countdown.load(Ordering::SeqCst);
            if current == 0 {
                return false;
            }
            if self
                .fault_countdown
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_event(&self, event: &NotificationEvent) -> StoreResult<()> {
        if self.events.contains_key(&event.event_id) {
            return Err(StoreError::DuplicateKey(event.event_id.clone()));
        }
        self.events.insert(event.event_id.clone(), event.clone());
        if let Some(card_id) = &event.card_id {
            self.events_by_card
                .entry(card_id.clone())
                .or_default()
                .push(event.event_id.clone());
        }
        Ok(())
    }

    async fn event_exists(&self, event_id: &str) -> StoreResult<bool> {
        Ok(self.events.contains_key(event_id))
    }

    async fn card_master_exists(&self, card_id: &str) -> StoreResult<bool> {
        Ok(self.card_master.contains_key(card_id))
    }

    async fn get_card_current(&self, card_id: &str) -> StoreResult<Option<CardCurrentRow>> {
        Ok(self.card_current.get(card_id).map(|r| r.clone()))
    }

    async fn get_last_known_description(&self, card_id: &str) -> StoreResult<Option<String>> {
        if let Some(row) = self.card_current.get(card_id) {
            return Ok(Some(row.description.clone()));
        }

        // Cache miss: fall back to the most recently processed event for
        // this card (§9 "cyclic relation" design note).
        let Some(event_ids) = self.events_by_card.get(card_id) else {
            return Ok(None);
        };
        let mut candidates: Vec<_> = event_ids
            .iter()
            .filter_map(|id| self.events.get(id).map(|e| e.clone()))
            .filter(|e| e.processed)
            .collect();
        candidates.sort_by_key(|e| e.action_time);
        Ok(candidates
            .last()
            .and_then(|e| e.raw_payload.get("card").and_then(|c| c.get("desc")))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()))
    }

    async fn insert_card_master_if_absent(
        &self,
        row: &CardMasterRow,
    ) -> StoreResult<MasterInsertOutcome> {
        match self.card_master.entry(row.card_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(MasterInsertOutcome::AlreadyPresent),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(row.clone());
                Ok(MasterInsertOutcome::Inserted)
            }
        }
    }

    async fn upsert_card_current(&self, row: &CardCurrentRow) -> StoreResult<()> {
        if self.consume_fault() {
            return Err(StoreError::Deferred("streaming buffer".into()));
        }
        self.card_current.insert(row.card_id.clone(), row.clone());
        Ok(())
    }

    async fn replace_line_items_current(
        &self,
        card_id: &str,
        rows: &[LineItemRow],
    ) -> StoreResult<()> {
        if self.consume_fault() {
            return Err(StoreError::Deferred("streaming buffer".into()));
        }
        self.line_items_current
            .insert(card_id.to_string(), rows.to_vec());
        Ok(())
    }

    async fn insert_line_items_master(&self, card_id: &str, rows: &[LineItemRow]) -> StoreResult<()> {
        if rows
            .iter()
            .any(|r| self.line_items_master.contains_key(&(card_id.to_string(), r.line_index)))
        {
            return Ok(());
        }
        for row in rows {
            self.line_items_master
                .insert((card_id.to_string(), row.line_index), row.clone());
        }
        Ok(())
    }

    async fn finalize_event(
        &self,
        event_id: &str,
        success: bool,
        triggered_extraction: bool,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        let mut entry = self
            .events
            .get_mut(event_id)
            .ok_or_else(|| StoreError::Permanent(format!("unknown event {event_id}")))?;
        entry.processed = success;
        entry.processed_at = Some(Utc::now());
        entry.extraction_triggered = triggered_extraction;
        entry.error_message = error_message.map(|s| s.to_string());
        Ok(())
    }

    async fn enqueue_pending(&self, op: PendingUpdate) -> StoreResult<()> {
        self.pending.insert(op.update_id.clone(), op);
        Ok(())
    }

    async fn claim_pending(
        &self,
        limit: usize,
        now: chrono::DateTime<chrono::Utc>,
    ) -> StoreResult<Vec<PendingUpdate>> {
        // `DashMap` iteration order is arbitrary, so due rows are collected
        // and sorted by `first_queued_at` before truncating to `limit` —
        // matching `BigQueryStore::claim_pending`'s `ORDER BY
        // first_queued_at ASC`, which the retry worker's sequential,
        // dependents-before-finalize processing depends on.
        let mut due: Vec<PendingUpdate> = self
            .pending
            .iter()
            .filter(|entry| entry.status == PendingStatus::Pending && entry.next_retry_at <= now)
            .map(|entry| entry.clone())
            .collect();
        due.sort_by_key(|op| op.first_queued_at);
        due.truncate(limit);

        for op in &due {
            if let Some(mut entry) = self.pending.get_mut(&op.update_id) {
                entry.status = PendingStatus::Processing;
            }
        }
        Ok(due)
    }

    async fn complete_pending(
        &self,
        update_id: &str,
        outcome: PendingOutcome,
        error_message: Option<&str>,
        max_retries: u32,
    ) -> StoreResult<()> {
        let mut entry = self
            .pending
            .get_mut(update_id)
            .ok_or_else(|| StoreError::Permanent(format!("unknown pending update {update_id}")))?;

        match outcome {
            PendingOutcome::Succeeded => {
                entry.status = PendingStatus::Completed;
                entry.completed_at = Some(Utc::now());
                entry.error_message = None;
            }
            PendingOutcome::Failed => {
                entry.retry_count += 1;
                entry.last_retry_at = Some(Utc::now());
                entry.error_message = error_message.map(|s| s.to_string());
                if entry.retry_count >= max_retries {
                    entry.status = PendingStatus::Failed;
                } else {
                    entry.status = PendingStatus::Pending;
                    entry.next_retry_at = next_retry_at(Utc::now(), entry.retry_count);
                }
            }
        }
        Ok(())
    }

    async fn pending_update_status(&self, update_id: &str) -> StoreResult<Option<PendingStatus>> {
        Ok(self.pending.get(update_id).map(|e| e.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActionKind, ExtractedCardFields, OperationKind};

    fn sample_event(event_id: &str, card_id: &str) -> NotificationEvent {
        NotificationEvent {
            event_id: event_id.to_string(),
            action_kind: ActionKind::CardCreated,
            action_time: Utc::now(),
            card_id: Some(card_id.to_string()),
            board_id: Some("B1".into()),
            board_name: Some("Board".into()),
            list_before_id: None,
            list_before_name: None,
            list_after_id: None,
            list_after_name: None,
            is_list_transition: false,
            actor_id: None,
            actor_name: None,
            raw_payload: serde_json::json!({"card": {"desc": "1x Sign $100"}}),
            processed: false,
            processed_at: None,
            extraction_triggered: false,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    fn sample_master(card_id: &str) -> CardMasterRow {
        CardMasterRow {
            card_id: card_id.to_string(),
            name: "Order".into(),
            description: "1x Sign $100".into(),
            labels: vec![],
            closed: false,
            board_id: "B1".into(),
            board_name: Some("Board".into()),
            list_id: None,
            list_name: None,
            extracted: ExtractedCardFields::default(),
            created_date: Utc::now(),
            line_item_count: 1,
            first_extracted_at: Some(Utc::now()),
            first_extraction_event_id: Some("E1".into()),
        }
    }

    #[tokio::test]
    async fn insert_event_rejects_duplicates() {
        let store = InMemoryStore::new();
        let event = sample_event("E1", "C1");
        store.insert_event(&event).await.unwrap();
        let err = store.insert_event(&event).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn master_insert_if_absent_is_idempotent() {
        let store = InMemoryStore::new();
        let row = sample_master("C1");
        let first = store.insert_card_master_if_absent(&row).await.unwrap();
        assert_eq!(first, MasterInsertOutcome::Inserted);

        let mut changed = row.clone();
        changed.name = "Different name".into();
        let second = store.insert_card_master_if_absent(&changed).await.unwrap();
        assert_eq!(second, MasterInsertOutcome::AlreadyPresent);

        // The stored row is still the first one, unchanged.
        assert_eq!(store.card_master_row("C1").unwrap().name, "Order");
    }

    #[tokio::test]
    async fn replace_line_items_current_is_a_full_swap() {
        let store = InMemoryStore::new();
        let first_run = vec![LineItemRow {
            card_id: "C1".into(),
            line_index: 1,
            quantity: 1.0,
            raw_price: 100.0,
            price_kind: crate::PriceKind::Total,
            unit_price: 100.0,
            total_revenue: 100.0,
            description: None,
            business_line: crate::BusinessLine::Unclassified,
            material: None,
            dimensions: None,
        }];
        store
            .replace_line_items_current("C1", &first_run)
            .await
            .unwrap();
        assert_eq!(store.line_items_current_rows("C1").len(), 1);

        let second_run = vec![
            LineItemRow {
                line_index: 1,
                quantity: 2.0,
                raw_price: 300.0,
                unit_price: 150.0,
                total_revenue: 300.0,
                ..first_run[0].clone()
            },
        ];
        store
            .replace_line_items_current("C1", &second_run)
            .await
            .unwrap();
        let rows = store.line_items_current_rows("C1");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].unit_price, 150.0);
    }

    #[tokio::test]
    async fn claim_pending_only_claims_due_pending_rows() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let due = PendingUpdate {
            update_id: store.next_update_id(),
            operation_kind: OperationKind::ReplaceLineItems,
            target_table: "line_items_current".into(),
            payload: serde_json::json!({}),
            retry_count: 0,
            first_queued_at: now,
            last_retry_at: None,
            next_retry_at: now,
            status: PendingStatus::Pending,
            error_message: None,
            completed_at: None,
            created_at: now,
            depends_on: Vec::new(),
        };
        let not_due = PendingUpdate {
            update_id: store.next_update_id(),
            next_retry_at: now + chrono::Duration::hours(1),
            ..due.clone()
        };
        store.enqueue_pending(due.clone()).await.unwrap();
        store.enqueue_pending(not_due).await.unwrap();

        let claimed = store.claim_pending(10, now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].update_id, due.update_id);

        // Claimed rows move to `processing` and won't be claimed twice.
        let claimed_again = store.claim_pending(10, now).await.unwrap();
        assert!(claimed_again.is_empty());
    }

    #[tokio::test]
    async fn complete_pending_fails_terminally_after_max_retries() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let op = PendingUpdate {
            update_id: store.next_update_id(),
            operation_kind: OperationKind::FinalizeEvent,
            target_table: "events".into(),
            payload: serde_json::json!({}),
            retry_count: 0,
            first_queued_at: now,
            last_retry_at: None,
            next_retry_at: now,
            status: PendingStatus::Processing,
            error_message: None,
            completed_at: None,
            created_at: now,
            depends_on: Vec::new(),
        };
        store.enqueue_pending(op.clone()).await.unwrap();

        for _ in 0..2 {
            store
                .complete_pending(&op.update_id, PendingOutcome::Failed, Some("boom"), 2)
                .await
                .unwrap();
        }

        let rows = store.pending_rows();
        assert_eq!(rows[0].status, PendingStatus::Failed);
        assert_eq!(rows[0].retry_count, 2);
    }
}
