//! Row types for the five persistent tables (§3 of the data model).
//!
//! These mirror the analytical-store schema column-for-column; the adapter
//! never papers over a missing field with a default that the store itself
//! wouldn't apply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of action a notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CardCreated,
    CardUpdated,
    Other,
}

/// An append-only record of one notification received from the source platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub event_id: String,
    pub action_kind: ActionKind,
    pub action_time: DateTime<Utc>,
    pub card_id: Option<String>,
    pub board_id: Option<String>,
    pub board_name: Option<String>,
    pub list_before_id: Option<String>,
    pub list_before_name: Option<String>,
    pub list_after_id: Option<String>,
    pub list_after_name: Option<String>,
    pub is_list_transition: bool,
    pub actor_id: Option<String>,
    pub actor_name: Option<String>,
    pub raw_payload: serde_json::Value,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub extraction_triggered: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NotificationEvent {
    /// `is_list_transition = (list_before_id present AND list_after_id present AND list_before_id != list_after_id)`.
    pub fn compute_is_list_transition(before: &Option<String>, after: &Option<String>) -> bool {
        matches!((before, after), (Some(b), Some(a)) if b != a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceKind {
    PerUnit,
    Total,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessLine {
    Signage,
    Printing,
    Engraving,
    Unclassified,
}

/// A single line item produced by the extractor, shared by both the
/// master and current line-item tables (identical column shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemRow {
    pub card_id: String,
    pub line_index: u32,
    pub quantity: f64,
    pub raw_price: f64,
    pub price_kind: PriceKind,
    pub unit_price: f64,
    pub total_revenue: f64,
    pub description: Option<String>,
    pub business_line: BusinessLine,
    pub material: Option<String>,
    pub dimensions: Option<String>,
}

/// Enriched card-level fields produced by the extractor, shared by the
/// master and current card tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedCardFields {
    pub purchaser: Option<String>,
    pub buyer_name: Option<String>,
    pub buyer_email: Option<String>,
    pub order_summary: Option<String>,
}

/// Append-only snapshot of a card's first observed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardMasterRow {
    pub card_id: String,
    pub name: String,
    pub description: String,
    pub labels: Vec<String>,
    pub closed: bool,
    pub board_id: String,
    pub board_name: Option<String>,
    pub list_id: Option<String>,
    pub list_name: Option<String>,
    pub extracted: ExtractedCardFields,
    pub created_date: DateTime<Utc>,
    pub line_item_count: u32,
    pub first_extracted_at: Option<DateTime<Utc>>,
    pub first_extraction_event_id: Option<String>,
}

/// Mutable current-state projection; same columns as the master row plus
/// bookkeeping about the last applicable notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardCurrentRow {
    pub card_id: String,
    pub name: String,
    pub description: String,
    pub labels: Vec<String>,
    pub closed: bool,
    pub board_id: String,
    pub board_name: Option<String>,
    pub list_id: Option<String>,
    pub list_name: Option<String>,
    pub extracted: ExtractedCardFields,
    pub created_date: DateTime<Utc>,
    pub line_item_count: u32,
    pub last_updated_at: DateTime<Utc>,
    pub last_extracted_at: Option<DateTime<Utc>>,
    pub last_extraction_event_id: Option<String>,
    pub last_event_type: ActionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    UpsertCard,
    ReplaceLineItems,
    FinalizeEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A deferred store operation awaiting retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub update_id: String,
    pub operation_kind: OperationKind,
    pub target_table: String,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub first_queued_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: DateTime<Utc>,
    pub status: PendingStatus,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// `update_id`s of sibling pending rows this one must not be applied
    /// ahead of. Only ever populated on `finalize_event` entries, naming the
    /// dependent `upsert_card`/`replace_line_items` rows queued in the same
    /// batch — the retry worker re-defers a `finalize_event` row until all
    /// of these report `completed`.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Outcome of a single pending-update attempt, reported back to `complete_pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOutcome {
    Succeeded,
    Failed,
}

/// Normalizes a description for description-equality comparisons (§4.D):
/// trimmed, newline-canonicalized, null treated as empty.
pub fn normalize_description(desc: Option<&str>) -> String {
    desc.unwrap_or("")
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_transition_requires_both_present_and_distinct() {
        assert!(!NotificationEvent::compute_is_list_transition(&None, &None));
        assert!(!NotificationEvent::compute_is_list_transition(
            &Some("L1".into()),
            &None
        ));
        assert!(!NotificationEvent::compute_is_list_transition(
            &Some("L1".into()),
            &Some("L1".into())
        ));
        assert!(NotificationEvent::compute_is_list_transition(
            &Some("L1".into()),
            &Some("L2".into())
        ));
    }

    #[test]
    fn normalize_treats_null_as_empty_and_canonicalizes_newlines() {
        assert_eq!(normalize_description(None), "");
        assert_eq!(
            normalize_description(Some("  a\r\nb\r  ")),
            "a\nb"
        );
    }
}
