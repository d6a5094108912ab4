//! Numerical post-processing for line items, inside the extractor boundary
//! (§4.C). Pure and synchronous — no LLM call involved here, only the
//! arithmetic that turns an LLM's raw guess at price/quantity into the two
//! derived columns the analytical store expects.

use serde::Deserialize;
use store_adapter::{BusinessLine, LineItemRow, PriceKind};

/// Shape of one line item as returned by the LLM, before derived fields are
/// computed.
#[derive(Debug, Clone, Deserialize)]
pub struct RawLineItem {
    pub quantity: f64,
    pub raw_price: f64,
    pub price_kind: PriceKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_business_line")]
    pub business_line: BusinessLine,
    #[serde(default)]
    pub material: Option<String>,
    #[serde(default)]
    pub dimensions: Option<String>,
}

fn default_business_line() -> BusinessLine {
    BusinessLine::Unclassified
}

/// Derives `unit_price` and `total_revenue` from `raw_price`, `price_kind`,
/// and `quantity`, and assigns 1-based `line_index` in input order.
pub fn finalize_line_items(card_id: &str, raw_items: &[RawLineItem]) -> Vec<LineItemRow> {
    raw_items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let (unit_price, total_revenue) = match item.price_kind {
                PriceKind::PerUnit => (item.raw_price, item.raw_price * item.quantity),
                PriceKind::Total => {
                    let unit_price = if item.quantity >= 1.0 {
                        item.raw_price / item.quantity
                    } else {
                        item.raw_price
                    };
                    (unit_price, item.raw_price)
                }
            };

            LineItemRow {
                card_id: card_id.to_string(),
                line_index: (i + 1) as u32,
                quantity: item.quantity,
                raw_price: item.raw_price,
                price_kind: item.price_kind,
                unit_price,
                total_revenue,
                description: item.description.clone(),
                business_line: item.business_line,
                material: item.material.clone(),
                dimensions: item.dimensions.clone(),
            }
        })
        .collect()
}
