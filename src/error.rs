//! The disjoint error taxonomy for a migration run.
//!
//! `MissingParent` is deliberately not a variant here: it is a non-fatal
//! report row (see [`crate::progress::MissingParent`]), not an error.

use std::fmt;

/// Top-level error kind for a migration run.
#[derive(Debug, Clone)]
pub enum MigrateError {
    /// An object or required field is absent on one side. Raised before
    /// any data moves.
    Schema { detail: String },
    /// The query could not be parsed.
    QueryMalformed { detail: String },
    /// A single HTTP call failed. The engine may retry per its policy
    /// before this ever surfaces; once surfaced it is final for that call.
    ApiTransport { detail: String },
    /// An engine terminated in a failed/aborted state. Fatal for the task.
    ApiOperationFailed { object: String, detail: String },
    /// Explicit user refusal at an abort prompt.
    UserAborted,
    /// Report or cache I/O failed.
    Filesystem { path: String, detail: String },
}

impl fmt::Display for MigrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrateError::Schema { detail } => write!(f, "schema error: {detail}"),
            MigrateError::QueryMalformed { detail } => {
                write!(f, "malformed query: {detail}")
            }
            MigrateError::ApiTransport { detail } => write!(f, "transport error: {detail}"),
            MigrateError::ApiOperationFailed { object, detail } => {
                write!(f, "operation failed for {object}: {detail}")
            }
            MigrateError::UserAborted => write!(f, "aborted by user"),
            MigrateError::Filesystem { path, detail } => {
                write!(f, "filesystem error at {path}: {detail}")
            }
        }
    }
}

impl std::error::Error for MigrateError {}

impl MigrateError {
    pub fn schema(detail: impl Into<String>) -> Self {
        MigrateError::Schema { detail: detail.into() }
    }

    pub fn query_malformed(detail: impl Into<String>) -> Self {
        MigrateError::QueryMalformed { detail: detail.into() }
    }

    pub fn api_transport(detail: impl Into<String>) -> Self {
        MigrateError::ApiTransport { detail: detail.into() }
    }

    pub fn api_operation_failed(object: impl Into<String>, detail: impl Into<String>) -> Self {
        MigrateError::ApiOperationFailed { object: object.into(), detail: detail.into() }
    }

    pub fn filesystem(path: impl Into<String>, detail: impl Into<String>) -> Self {
        MigrateError::Filesystem { path: path.into(), detail: detail.into() }
    }

    /// Whether a transport-level failure of this kind is worth retrying.
    /// Matches the propagation policy in the error handling design: transport
    /// errors are retried with bounded backoff inside the engine and only
    /// elevate to `ApiOperationFailed` once retries are exhausted.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MigrateError::ApiTransport { .. })
    }
}

pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = MigrateError::schema("Account.NotAField does not exist");
        assert!(err.to_string().contains("NotAField"));
    }

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(MigrateError::api_transport("timeout").is_retryable());
        assert!(!MigrateError::UserAborted.is_retryable());
        assert!(!MigrateError::api_operation_failed("Account", "boom").is_retryable());
    }
}
