//! Grepable error codes for errors that reach the UI-facing status.

use serde::Serialize;

/// Grepable error code and retryable flag for structured status payloads.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

/// Structured error as shown to an attached view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorStatus {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl ErrorStatus {
    #[must_use]
    pub fn from_error(err: &(impl ErrorCode + ?Sized)) -> Self {
        Self { code: err.error_code(), message: err.to_string(), retryable: err.retryable() }
    }
}
