//! Error taxonomy for the ingestion pipeline.
//!
//! Every failure that crosses a component boundary is classified into an
//! [`ErrorKind`]. The kind decides what happens next:
//!
//! | Kind | Policy |
//! |------|--------|
//! | `transient-network` | retry with exponential backoff |
//! | `rate-limited` | retry with a longer backoff |
//! | `malformed-input` | skip the unit and record it |
//! | `unsupported-format` | skip the unit and record it |
//! | `model-inference-failure` | degrade the prediction to `indeterminate` |
//! | `storage-conflict` | retry once, then fail the solicitation |
//! | `fatal-config` | abort the run before any work starts |

use std::fmt;

use thiserror::Error;

/// Classification of a failure, used to pick a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientNetwork,
    RateLimited,
    MalformedInput,
    UnsupportedFormat,
    ModelInferenceFailure,
    StorageConflict,
    FatalConfig,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientNetwork => "transient-network",
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::MalformedInput => "malformed-input",
            ErrorKind::UnsupportedFormat => "unsupported-format",
            ErrorKind::ModelInferenceFailure => "model-inference-failure",
            ErrorKind::StorageConflict => "storage-conflict",
            ErrorKind::FatalConfig => "fatal-config",
        }
    }

    /// Whether a failure of this kind may succeed when attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientNetwork | ErrorKind::RateLimited)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure talking to an upstream HTTP service.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("upstream returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("malformed upstream response: {0}")]
    Malformed(String),

    #[error("response exceeds {limit} bytes")]
    TooLarge { limit: u64 },
}

impl UpstreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpstreamError::RateLimited(_) => ErrorKind::RateLimited,
            UpstreamError::Transient(_) => ErrorKind::TransientNetwork,
            UpstreamError::Rejected { .. } | UpstreamError::NotFound(_) => {
                ErrorKind::MalformedInput
            }
            UpstreamError::Malformed(_) | UpstreamError::TooLarge { .. } => {
                ErrorKind::MalformedInput
            }
        }
    }

    /// Map an HTTP status to an upstream error. 429 and 5xx are retryable.
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        if status.as_u16() == 429 {
            UpstreamError::RateLimited(body)
        } else if status.is_server_error() {
            UpstreamError::Transient(format!("{}: {}", status, body))
        } else if status.as_u16() == 404 {
            UpstreamError::NotFound(body)
        } else {
            UpstreamError::Rejected {
                status: status.as_u16(),
                body,
            }
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            UpstreamError::Malformed(e.to_string())
        } else if let Some(status) = e.status() {
            UpstreamError::from_status(status, e.to_string())
        } else {
            // connect, timeout, body and request errors are all worth another attempt
            UpstreamError::Transient(e.to_string())
        }
    }
}

/// A raw upstream record that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid value for `{field}`: {value}")]
    InvalidField { field: &'static str, value: String },
}

impl PayloadError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::MalformedInput
    }
}

/// A failure in the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Lock contention or a unique-key race; worth one more attempt.
    #[error("storage conflict: {0}")]
    Conflict(String),

    /// The database could not be reached (I/O error, pool exhausted or closed).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Conflict(_) | StoreError::Unavailable(_) | StoreError::Other(_) => {
                ErrorKind::StorageConflict
            }
        }
    }

    /// Transient classes get one retry from the persistence coordinator.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => {
                // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
                let busy = matches!(db.code().as_deref(), Some("5") | Some("6"));
                if busy || db.is_unique_violation() {
                    StoreError::Conflict(e.to_string())
                } else {
                    StoreError::Other(e.to_string())
                }
            }
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Other(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Other(format!("json: {}", e))
    }
}

/// A failure loading or running the compliance model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model artifact not found: {0}")]
    Missing(String),

    #[error("invalid model artifact: {0}")]
    Invalid(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

impl ModelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModelError::Missing(_) | ModelError::Invalid(_) => ErrorKind::FatalConfig,
            ModelError::Inference(_) => ErrorKind::ModelInferenceFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_separates_retryable_codes() {
        let e = UpstreamError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, String::new());
        assert_eq!(e.kind(), ErrorKind::RateLimited);
        assert!(e.kind().is_retryable());

        let e = UpstreamError::from_status(reqwest::StatusCode::BAD_GATEWAY, String::new());
        assert_eq!(e.kind(), ErrorKind::TransientNetwork);

        let e = UpstreamError::from_status(reqwest::StatusCode::FORBIDDEN, String::new());
        assert!(!e.kind().is_retryable());
        assert!(matches!(e, UpstreamError::Rejected { status: 403, .. }));

        let e = UpstreamError::from_status(reqwest::StatusCode::NOT_FOUND, String::new());
        assert!(matches!(e, UpstreamError::NotFound(_)));
    }

    #[test]
    fn only_conflicts_and_outages_are_transient() {
        assert!(StoreError::Conflict("busy".into()).is_transient());
        assert!(StoreError::Unavailable("io".into()).is_transient());
        assert!(!StoreError::Other("syntax".into()).is_transient());
    }

    #[test]
    fn kinds_render_in_kebab_case() {
        assert_eq!(ErrorKind::ModelInferenceFailure.to_string(), "model-inference-failure");
        assert_eq!(ErrorKind::FatalConfig.as_str(), "fatal-config");
    }
}
