use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use store_adapter::ExtractedCardFields;

use crate::pricing::{finalize_line_items, RawLineItem};
use crate::{ExtractError, ExtractResult, ExtractionInput, ExtractionOutput, Extractor};

/// Truncates `s` to at most `max_len` bytes, backing off to the nearest
/// char boundary so multi-byte UTF-8 sequences are never split.
fn truncate_to_byte_len(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[derive(Debug, Clone)]
pub struct LlmExtractorConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    /// Hard cap, in bytes, on the card description sent to the extraction
    /// endpoint. Longer input is truncated, not rejected.
    pub max_input_length: usize,
}

impl LlmExtractorConfig {
    pub fn from_env() -> Result<Self, ExtractError> {
        let endpoint = std::env::var("EXTRACTOR_ENDPOINT")
            .map_err(|_| ExtractError::Protocol("missing EXTRACTOR_ENDPOINT".into()))?;
        let api_key = std::env::var("EXTRACTOR_API_KEY")
            .map_err(|_| ExtractError::Protocol("missing EXTRACTOR_API_KEY".into()))?;
        let model = std::env::var("EXTRACTOR_MODEL")
            .unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let timeout_secs: u64 = std::env::var("EXTRACTOR_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);
        let max_input_length: usize = std::env::var("MAX_INPUT_LENGTH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10_000);

        Ok(Self {
            endpoint,
            api_key,
            model,
            timeout: Duration::from_secs(timeout_secs),
            max_input_length,
        })
    }
}

#[derive(Serialize)]
struct ExtractionRequest<'a> {
    model: &'a str,
    card_name: &'a str,
    card_description: &'a str,
}

#[derive(Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    purchaser: Option<String>,
    #[serde(default)]
    buyer_name: Option<String>,
    #[serde(default)]
    buyer_email: Option<String>,
    #[serde(default)]
    order_summary: Option<String>,
    #[serde(default)]
    line_items: Vec<RawLineItem>,
}

/// LLM-backed [`Extractor`]. The extraction endpoint is treated as an
/// arbitrary HTTP collaborator: this client knows nothing about which model
/// or provider answers the request, only the JSON contract above.
pub struct LlmExtractor {
    config: LlmExtractorConfig,
    http: Client,
}

impl LlmExtractor {
    pub fn new(config: LlmExtractorConfig) -> ExtractResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExtractError::Protocol(e.to_string()))?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> ExtractResult<Self> {
        Self::new(LlmExtractorConfig::from_env()?)
    }
}

#[async_trait::async_trait]
impl Extractor for LlmExtractor {
    async fn extract(&self, input: &ExtractionInput) -> ExtractResult<ExtractionOutput> {
        // Empty description: not an error, just nothing to enrich (§4.C).
        if input.description.trim().is_empty() {
            return Ok(ExtractionOutput::default());
        }

        let description = truncate_to_byte_len(&input.description, self.config.max_input_length);
        if description.len() < input.description.len() {
            tracing::warn!(
                card_id = %input.card_id,
                original_len = input.description.len(),
                truncated_len = description.len(),
                "truncated card description before sending to extractor"
            );
        }

        let request_body = ExtractionRequest {
            model: &self.config.model,
            card_name: &input.name,
            card_description: description,
        };

        let response = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExtractError::Timeout(self.config.timeout)
                } else {
                    ExtractError::Failed(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(ExtractError::Failed(format!(
                "extractor endpoint returned {}",
                response.status()
            )));
        }

        let parsed: ExtractionResponse = response
            .json()
            .await
            .map_err(|e| ExtractError::Protocol(e.to_string()))?;

        let fields = ExtractedCardFields {
            purchaser: parsed.purchaser,
            buyer_name: parsed.buyer_name,
            buyer_email: parsed.buyer_email,
            order_summary: parsed.order_summary,
        };
        let line_items = finalize_line_items(&input.card_id, &parsed.line_items);

        Ok(ExtractionOutput { fields, line_items })
    }
}
