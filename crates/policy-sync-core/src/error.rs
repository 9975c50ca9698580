use thiserror::Error;

/// Error types for policy reconciliation.
///
/// Only transport failures, protocol violations, timeouts and local defects
/// are represented here. Per-object outcomes returned by the remote service
/// (not found, bad request, missing role) are folded into
/// [`PolicyResult`](crate::model::PolicyResult) values instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error(
        "Batch response count mismatch: {requests} requests were sent but {responses} responses were received"
    )]
    ResponseCountMismatch { requests: usize, responses: usize },

    #[error("Batch response name '{0}' is not a request index")]
    InvalidCorrelation(String),

    #[error("Batch accepted for asynchronous processing without a location header")]
    MissingPollLocation,

    #[error("Timed out after {elapsed_secs}s waiting for {pending} pending batch chunk(s)")]
    PollTimeout { pending: usize, elapsed_secs: u64 },

    #[error("Malformed policy file {path}: {reason}")]
    MalformedPolicy { path: String, reason: String },

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Force update failed and was reverted: {0}")]
    ForceUpdateFailed(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid glob pattern: {0}")]
    Glob(#[from] globset::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

impl SyncError {
    /// Create a new HttpStatus error
    pub fn http_status(status: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            body: body.into(),
        }
    }

    /// Create a new MalformedPolicy error
    pub fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPolicy {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a new Credential error
    pub fn credential(message: impl Into<String>) -> Self {
        Self::Credential(message.into())
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Check if this error is worth another attempt at the transport level
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::HttpStatus { status, .. } => matches!(status, 408 | 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_mismatch_message_names_both_counts() {
        let err = SyncError::ResponseCountMismatch {
            requests: 3,
            responses: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("3 requests"));
        assert!(msg.contains("2 responses"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::http_status(503, "busy").is_transient());
        assert!(SyncError::http_status(429, "").is_transient());
        assert!(!SyncError::http_status(400, "bad").is_transient());
        assert!(!SyncError::malformed("a/policy.json", "missing id").is_transient());
    }
}
