#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("extraction timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("extraction failed: {0}")]
    Failed(String),

    #[error("extractor returned an unparsable response: {0}")]
    Protocol(String),
}

pub type ExtractResult<T> = Result<T, ExtractError>;
