//! Error types for foglamp-store.

/// Result type for foglamp-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in foglamp-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The payload or query document is not well-formed JSON.
    #[error("Failed to parse JSON payload: {0}")]
    Parse(#[from] serde_json::Error),

    /// The document parses but violates the expected shape.
    #[error("{operation}: {message}")]
    Shape {
        operation: &'static str,
        message: String,
    },

    /// A `user_ts` value does not match an accepted form.
    #[error("Invalid date |{0}|")]
    Date(String),

    /// Database error from SQLite other than busy/locked.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A statement stayed busy through every retry.
    #[error("Database still busy after {attempts} retries")]
    BusyExhausted { attempts: u32 },

    /// Invariant violation; fatal for the current request only.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a [`Error::Shape`] with an operation tag, mirroring the
    /// logged `raiseError(operation, message)` calls in the storage plugin.
    pub(crate) fn shape(operation: &'static str, message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(operation, %message, "request rejected");
        Error::Shape { operation, message }
    }
}
