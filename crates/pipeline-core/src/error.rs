use thiserror::Error;

/// Why an adapter produced no result without failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingApiKey(String),
    ProviderDisabled(String),
    UnsupportedProvider(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingApiKey(p) => write!(f, "missing api key for provider {}", p),
            SkipReason::ProviderDisabled(p) => write!(f, "provider {} disabled", p),
            SkipReason::UnsupportedProvider(p) => write!(f, "unsupported provider tag {}", p),
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Data missing: {0}")]
    DataMissing(String),

    #[error("Provider transient error: {0}")]
    ProviderTransient(String),

    #[error("Provider fatal error: {0}")]
    ProviderFatal(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Step '{step}' failed: {reason}")]
    StepExecution { step: String, reason: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Storage transient error: {0}")]
    StorageTransient(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Errors worth another attempt with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::ProviderTransient(_) | PipelineError::StorageTransient(_)
        )
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Parse(e.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
