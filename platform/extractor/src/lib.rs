//! # Extractor
//!
//! Given a card's name and description, produces structured fields and a
//! list of line items. The extractor is a cooperating external collaborator
//! (an LLM) — the core treats it as a pure function with failure, the same
//! way `event-bus` treats `EventBus` as a trait object regardless of
//! transport.

mod error;
pub mod llm;
pub mod pricing;

pub use error::{ExtractError, ExtractResult};

use async_trait::async_trait;
use store_adapter::{ExtractedCardFields, LineItemRow};

/// One card's worth of raw text handed to the extractor.
#[derive(Debug, Clone)]
pub struct ExtractionInput {
    pub card_id: String,
    pub name: String,
    pub description: String,
}

/// Structured output of one extraction run.
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutput {
    pub fields: ExtractedCardFields,
    pub line_items: Vec<LineItemRow>,
}

/// Given a card's name and description, produces enrichment fields and
/// line items.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, input: &ExtractionInput) -> ExtractResult<ExtractionOutput>;
}
