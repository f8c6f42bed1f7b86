use thiserror::Error;

/// Failure kinds the core distinguishes. Provider and storage seams speak
/// `anyhow`; this is where their errors acquire a policy.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("provider error: {0}")]
    Provider(#[source] anyhow::Error),

    #[error("structured output parse failed: {0}")]
    StructuredParse(String),

    #[error("team extraction produced no members")]
    TeamExtractionFailed,

    #[error("invalid knowledge base input: {0}")]
    KbInvalidInput(String),

    #[error("knowledge base entry not found: {0}")]
    KbNotFound(String),

    #[error("orchestration state persistence failed: {0}")]
    StatePersist(#[source] anyhow::Error),

    #[error("orchestration canceled")]
    Canceled,

    #[error("invalid request: {0}")]
    Policy(String),

    #[error("invariant violation: {0}")]
    FatalBug(String),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Canceled turns end silently; everything else surfaces to the client.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}
