//! Application error type
//!
//! Every component reports failures through [`Error`], tagged with an
//! [`ErrorKind`]. Validation and authorization errors are created where they
//! are detected and travel unchanged to the HTTP edge, which maps the kind to
//! a status code.

use std::error::Error as StdError;
use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Message returned to callers in place of internal error details.
pub const INTERNAL_MESSAGE: &str = "Internal error.";

/// Error taxonomy shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Uniqueness violation (duplicate key after retries, provider already linked).
    Conflict,
    /// Store failure, provider failure or any unexpected condition.
    Internal,
    /// Malformed or missing input.
    Invalid,
    /// No matching record.
    NotFound,
    /// Operation is not supported.
    NotImplemented,
    /// Missing or invalid caller identity, or caller is not the owner.
    Unauthorized,
}

impl ErrorKind {
    /// HTTP status code for this kind.
    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Invalid => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
            ErrorKind::Invalid => "invalid",
            ErrorKind::NotFound => "not_found",
            ErrorKind::NotImplemented => "not_implemented",
            ErrorKind::Unauthorized => "unauthorized",
        };
        f.write_str(code)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Wraps an unexpected failure as an internal error.
    pub fn internal(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invalid, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Message safe to show to the caller. Internal details stay server-side.
    pub fn public_message(&self) -> &str {
        match self.kind {
            ErrorKind::Internal => INTERNAL_MESSAGE,
            _ => &self.message,
        }
    }
}

macro_rules! internal_from {
    ($($ty:ty => $msg:literal),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(err: $ty) -> Self {
                    Error::internal($msg, err)
                }
            }
        )*
    };
}

internal_from! {
    redb::Error => "storage failure",
    redb::DatabaseError => "storage failure",
    redb::TransactionError => "storage transaction failure",
    redb::TableError => "storage table failure",
    redb::StorageError => "storage failure",
    redb::CommitError => "storage commit failure",
    serde_json::Error => "record encoding failure",
    reqwest::Error => "identity provider request failed",
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();

        if self.kind == ErrorKind::Internal {
            tracing::error!(error = %self, source = ?self.source, "internal error");
        }

        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_kind() {
        assert_eq!(ErrorKind::Conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(ErrorKind::Invalid.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorKind::NotImplemented.status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            ErrorKind::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ErrorKind::Internal.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_details_are_hidden() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = Error::internal("cannot open table", io);
        assert_eq!(err.public_message(), INTERNAL_MESSAGE);

        let err = Error::invalid("Missing URL.");
        assert_eq!(err.public_message(), "Missing URL.");
    }
}
