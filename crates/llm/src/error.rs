use thiserror::Error;

/// HTTP status codes worth another attempt: rate limiting and transient server faults.
const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS.contains(&status)
}

/// Errors produced by provider clients and the execution primitives built on them.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("retryable provider error (status {status}): {message}")]
    Retryable { status: u16, message: String },

    #[error("provider error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider '{0}' does not support batch submission")]
    BatchUnsupported(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<LlmError>,
    },
}

impl LlmError {
    /// Classify an HTTP failure by status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if is_retryable_status(status) {
            LlmError::Retryable { status, message }
        } else {
            LlmError::Api { status, message }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Retryable { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LlmError::Cancelled)
    }
}
