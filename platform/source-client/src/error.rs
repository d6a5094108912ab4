#[derive(Debug, thiserror::Error)]
pub enum SourceClientError {
    /// The card no longer exists (or never did) on the source platform.
    /// Terminal for the triggering notification — the dispatcher does not
    /// retry this.
    #[error("card not found: {0}")]
    CardAbsent(String),

    #[error("rate limit budget exhausted for this client")]
    RateLimited,

    #[error("source platform request failed: {0}")]
    Transport(String),

    #[error("source platform returned an unexpected response: {0}")]
    Protocol(String),
}

pub type SourceClientResult<T> = Result<T, SourceClientError>;
