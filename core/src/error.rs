use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error from {provider}: {details}")]
    Provider { provider: String, details: String },

    #[error("authentication rejected by {provider}: {details}")]
    Auth { provider: String, details: String },

    #[error("object storage error: {0}")]
    Storage(String),

    #[error("rate limit exceeded, retry after {retry_after_secs} seconds")]
    RateLimit { retry_after_secs: u64 },

    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("structural error: {0}")]
    Structural(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("coordination error: {0}")]
    Coordination(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage key already in use: {0}")]
    IdempotencyViolation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient failures, worth retrying with backoff. A rejected credential
    /// is not transient: retrying burns the provider's goodwill and the retry
    /// budget without any chance of success.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::Http(_)
                | Error::Storage(_)
                | Error::RateLimit { .. }
                | Error::Timeout(_)
                | Error::Io(_)
                | Error::Provider { .. }
        )
    }

    /// Structural failures abort the unit of work and never advance checkpoints.
    pub fn is_structural(&self) -> bool {
        matches!(self, Error::Structural(_) | Error::Serialization(_))
    }

    /// Rejected synchronously at the API boundary; the caller decides what to do.
    pub fn is_coordination(&self) -> bool {
        matches!(self, Error::Coordination(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::IdempotencyViolation(_))
    }

    /// Short classification string stored on failed jobs for operator triage.
    pub fn class(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::Database(_) => "database_error",
            Error::Http(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::Provider { .. } => "provider_error",
            Error::Auth { .. } => "auth_error",
            Error::Storage(_) => "storage_error",
            Error::RateLimit { .. } => "rate_limit",
            Error::Timeout(_) => "timeout",
            Error::Checkpoint(_) => "checkpoint_error",
            Error::Structural(_) => "structural_error",
            Error::Validation(_) => "validation_error",
            Error::Coordination(_) => "coordination_error",
            Error::NotFound(_) => "not_found",
            Error::IdempotencyViolation(_) => "idempotency_violation",
            Error::Io(_) => "io_error",
            Error::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(Error::Timeout(30).is_retryable());
        assert!(Error::RateLimit { retry_after_secs: 5 }.is_retryable());
        assert!(Error::Storage("write conflict".into()).is_retryable());
        assert!(!Error::Structural("schema mismatch".into()).is_retryable());
        assert!(!Error::Coordination("cycle".into()).is_retryable());
    }

    #[test]
    fn auth_rejection_is_terminal() {
        let e = Error::Auth {
            provider: "gmail".into(),
            details: "status 401".into(),
        };
        assert!(!e.is_retryable());
        assert_eq!(e.class(), "auth_error");
    }

    #[test]
    fn structural_errors_are_not_coordination() {
        let e = Error::Structural("unexpected column".into());
        assert!(e.is_structural());
        assert!(!e.is_coordination());
        assert_eq!(e.class(), "structural_error");
    }

    #[test]
    fn classes_are_stable_strings() {
        assert_eq!(Error::Timeout(1).class(), "timeout");
        assert_eq!(
            Error::IdempotencyViolation("k".into()).class(),
            "idempotency_violation"
        );
    }
}
