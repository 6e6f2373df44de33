use pipeline_core::PipelineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Missing API key for provider {0}")]
    MissingApiKey(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Rate limited by provider (status {0})")]
    RateLimited(u16),

    #[error("Service unavailable: status {status}: {body}")]
    ServiceUnavailable { status: u16, body: String },

    #[error("Authentication rejected: status {0}")]
    Unauthorized(u16),

    #[error("Request rejected: status {status}: {body}")]
    BadRequest { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Empty completion")]
    EmptyContent,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LlmError {
    /// Network trouble, timeouts, 429 and 5xx are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RequestFailed(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LlmError::RateLimited(_) | LlmError::ServiceUnavailable { .. } => true,
            LlmError::EmptyContent => true,
            _ => false,
        }
    }

    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => LlmError::RateLimited(status),
            401 | 403 => LlmError::Unauthorized(status),
            s if s >= 500 => LlmError::ServiceUnavailable { status, body },
            _ => LlmError::BadRequest { status, body },
        }
    }
}

impl From<LlmError> for PipelineError {
    fn from(e: LlmError) -> Self {
        if e.is_transient() {
            PipelineError::ProviderTransient(e.to_string())
        } else {
            PipelineError::ProviderFatal(e.to_string())
        }
    }
}

pub type LlmResult<T> = Result<T, LlmError>;
