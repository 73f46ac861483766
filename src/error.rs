//! Error types for mail-triage.

use std::time::Duration;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mail API error: {0}")]
    MailApi(#[from] MailApiError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Database-related errors.
///
/// All storage failures funnel into one kind carrying the original cause;
/// callers abort the current unit of work (one message, one cycle step)
/// but never the whole cycle.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Schema initialization failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        DatabaseError::Query(e.to_string())
    }
}

/// Mail capability errors.
#[derive(Debug, thiserror::Error)]
pub enum MailApiError {
    /// Delta cursor no longer valid (HTTP 410); triggers the
    /// cursor-clear + timestamp fallback. Not a degradation signal.
    #[error("Delta token expired for folder {folder}")]
    DeltaTokenExpired { folder: String },

    /// Rate limit honored by the transport; surfaces here after its
    /// retries are exhausted.
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Optimistic-concurrency loss (412) on category merges.
    #[error("Conflict updating {resource_id}: {message}")]
    Conflict { resource_id: String, message: String },

    #[error("Mail API returned status {status_code}: {message}")]
    Status { status_code: u16, message: String },

    #[error("Mail API request timed out: {0}")]
    Timeout(String),

    #[error("Mail API connection error: {0}")]
    Connection(String),

    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl MailApiError {
    /// Whether this error counts against the Graph-side degradation
    /// counter. Cursor expiry has its own fallback path and does not.
    pub fn is_degradation_signal(&self) -> bool {
        !matches!(self, MailApiError::DeltaTokenExpired { .. })
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("LLM connection error: {0}")]
    Connection(String),

    #[error("LLM returned status {status_code}: {message}")]
    Status { status_code: u16, message: String },

    #[error("Invalid LLM response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Transient errors the transport retry layer is allowed to retry.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::Connection(_) => true,
            LlmError::Status { status_code, .. } => (500..600).contains(status_code),
            LlmError::InvalidResponse(_) => false,
        }
    }
}

/// Terminal classification failure after the attempt budget is spent.
///
/// Carries the email id and attempt count so the engine can update the
/// email's attempt counter and mark it failed when warranted.
#[derive(Debug, thiserror::Error)]
#[error("Classification failed for email {email_id} after {attempts} attempts: {last_error}")]
pub struct ClassificationError {
    pub email_id: String,
    pub attempts: u32,
    pub last_error: String,
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_expiry_is_not_a_degradation_signal() {
        let e = MailApiError::DeltaTokenExpired {
            folder: "Inbox".into(),
        };
        assert!(!e.is_degradation_signal());

        let e = MailApiError::Status {
            status_code: 500,
            message: "server error".into(),
        };
        assert!(e.is_degradation_signal());
    }

    #[test]
    fn llm_transient_classification() {
        assert!(LlmError::RateLimited { retry_after: None }.is_transient());
        assert!(LlmError::Connection("reset".into()).is_transient());
        assert!(
            LlmError::Status {
                status_code: 503,
                message: "overloaded".into()
            }
            .is_transient()
        );
        assert!(
            !LlmError::Status {
                status_code: 400,
                message: "bad request".into()
            }
            .is_transient()
        );
        assert!(!LlmError::InvalidResponse("no tool call".into()).is_transient());
    }

    #[test]
    fn classification_error_display_includes_context() {
        let e = ClassificationError {
            email_id: "msg-001".into(),
            attempts: 3,
            last_error: "Empty folder path".into(),
        };
        let text = e.to_string();
        assert!(text.contains("msg-001"));
        assert!(text.contains("3 attempts"));
    }
}
