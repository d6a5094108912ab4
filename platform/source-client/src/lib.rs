//! # Source Client
//!
//! Read-only client for the source platform's card API. The only operation
//! the core pipeline needs is "fetch a card by id" — everything else (board
//! browsing, writes, attachments upload) belongs to the out-of-scope
//! dashboard and batch tooling.
//!
//! Mirrors the `EventBus` shape from `event-bus`: a thin trait so the
//! dispatcher can be tested against a fake without a live source platform.

pub mod card;
mod error;
pub mod ratelimit;
pub mod trello;

pub use card::Card;
pub use error::{SourceClientError, SourceClientResult};
pub use trello::{TrelloClient, TrelloConfig};

use async_trait::async_trait;

/// Read-only access to the source platform's cards.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Fetches a card's full fields, labels, and recent actions.
    ///
    /// Returns [`SourceClientError::CardAbsent`] for a 404 — the dispatcher
    /// treats that as terminal and non-retryable for the triggering event.
    async fn fetch_card(&self, card_id: &str) -> SourceClientResult<Card>;
}
