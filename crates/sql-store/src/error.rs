use pipeline_core::PipelineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Lock contention, pool exhaustion, network blips. Worth retrying.
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("storage error: {0}")]
    Fatal(String),

    #[error("column '{column}': {reason}")]
    Column { column: String, reason: String },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub(crate) fn column(column: &str, reason: impl Into<String>) -> Self {
        StoreError::Column {
            column: column.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => {
                StoreError::Transient(e.to_string())
            }
            sqlx::Error::Database(db) => {
                let msg = db.message().to_ascii_lowercase();
                if msg.contains("locked") || msg.contains("busy") {
                    StoreError::Transient(e.to_string())
                } else {
                    StoreError::Fatal(e.to_string())
                }
            }
            _ => StoreError::Fatal(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            StoreError::Transient(e.to_string())
        } else {
            StoreError::Fatal(e.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Fatal(format!("json: {}", e))
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Transient(msg) => PipelineError::StorageTransient(msg),
            other => PipelineError::Storage(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
