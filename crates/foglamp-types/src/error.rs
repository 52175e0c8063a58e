//! Error types for payload parsing in foglamp-types.

use thiserror::Error;

/// Errors that can occur when validating reading payloads.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The timestamp does not match any accepted `user_ts` form.
    #[error("Invalid timestamp: |{0}|")]
    InvalidTimestamp(String),
}

/// Result type alias using foglamp-types' [`ParseError`] type.
pub type ParseResult<T> = core::result::Result<T, ParseError>;
