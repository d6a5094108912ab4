//! # Store Adapter
//!
//! A platform-level abstraction over the analytical store's logical
//! operations: event append, master/current projections for cards and
//! line items, and the pending-updates retry queue.
//!
//! ## Why This Lives in Tier 1
//!
//! Every notification-processing concern in `card-sync` goes through this
//! one trait. Keeping it here lets the dispatcher, the retry worker, and
//! tests all depend on `Store` without caring whether the backing store is
//! BigQuery or an in-memory fake.
//!
//! ## Implementations
//!
//! - **BigQueryStore**: production implementation backed by `gcp-bigquery-client`.
//! - **InMemoryStore**: test/dev implementation backed by `dashmap`.

pub mod backoff;
pub mod bigquery;
pub mod memory;
pub mod model;

pub use backoff::next_retry_at;
pub use bigquery::BigQueryStore;
pub use memory::InMemoryStore;
pub use model::*;

use async_trait::async_trait;

/// Errors that can occur against the analytical store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("event_id already recorded: {0}")]
    DuplicateKey(String),

    /// The row is still inside the store's streaming buffer and cannot
    /// currently participate in a merge/delete. Callers must enqueue a
    /// retry rather than fail the notification outright.
    #[error("store operation deferred (streaming buffer): {0}")]
    Deferred(String),

    /// Anything that retrying will not fix: schema mismatch, auth failure,
    /// malformed query.
    #[error("permanent store failure: {0}")]
    Permanent(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of `insert_card_master_if_absent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterInsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// Core store abstraction for the notification-ingestion pipeline.
///
/// All operations described in §4.A of the design. Implementations must
/// distinguish [`StoreError::Deferred`] (queue for retry) from
/// [`StoreError::Permanent`] (surface to the operator) — the dispatcher's
/// retry behavior depends on that distinction being accurate.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_event(&self, event: &NotificationEvent) -> StoreResult<()>;

    async fn event_exists(&self, event_id: &str) -> StoreResult<bool>;

    /// Whether a card-master row exists for `card_id`. The change classifier
    /// uses this (rather than `get_last_known_description`'s presence) to
    /// decide `new` vs. everything else, since master rows are immutable
    /// and never raced the way current-state rows can be.
    async fn card_master_exists(&self, card_id: &str) -> StoreResult<bool>;

    /// Reads from card-current first; falls back to the most recent
    /// processed event for that card if card-current has no row yet.
    async fn get_last_known_description(&self, card_id: &str) -> StoreResult<Option<String>>;

    /// Full current-state row, used by the `metadata_only` write path to
    /// carry forward enrichment fields that this notification didn't touch.
    async fn get_card_current(&self, card_id: &str) -> StoreResult<Option<CardCurrentRow>>;

    async fn insert_card_master_if_absent(
        &self,
        row: &CardMasterRow,
    ) -> StoreResult<MasterInsertOutcome>;

    async fn upsert_card_current(&self, row: &CardCurrentRow) -> StoreResult<()>;

    /// Atomically drops all current line items for `card_id` and inserts
    /// `rows`. Readers may observe either the old or the new complete set,
    /// never a partial merge of the two.
    async fn replace_line_items_current(
        &self,
        card_id: &str,
        rows: &[LineItemRow],
    ) -> StoreResult<()>;

    /// Append-only; a no-op if any row already exists for `(card_id, line_index)`.
    async fn insert_line_items_master(&self, card_id: &str, rows: &[LineItemRow]) -> StoreResult<()>;

    async fn finalize_event(
        &self,
        event_id: &str,
        success: bool,
        triggered_extraction: bool,
        error_message: Option<&str>,
    ) -> StoreResult<()>;

    async fn enqueue_pending(&self, op: PendingUpdate) -> StoreResult<()>;

    /// Atomically transitions up to `limit` due, `pending` rows to
    /// `processing`. Claims never overlap across callers.
    async fn claim_pending(
        &self,
        limit: usize,
        now: chrono::DateTime<chrono::Utc>,
    ) -> StoreResult<Vec<PendingUpdate>>;

    async fn complete_pending(
        &self,
        update_id: &str,
        outcome: PendingOutcome,
        error_message: Option<&str>,
        max_retries: u32,
    ) -> StoreResult<()>;

    /// Current status of a pending update, used to check a `finalize_event`
    /// entry's [`PendingUpdate::depends_on`] before applying it. `None` if
    /// the id is unknown (already cleaned up, or never enqueued).
    async fn pending_update_status(&self, update_id: &str) -> StoreResult<Option<PendingStatus>>;
}
