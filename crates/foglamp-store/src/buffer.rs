//! Append-only SQL text builder.
//!
//! The compiler and the purge loop assemble statements fragment by
//! fragment; `SqlBuffer` accumulates them and yields one owned string.
//! Numbers are always formatted in the C locale (Rust's default), never
//! the process locale.

/// An append-only buffer of SQL fragments.
#[derive(Debug, Default)]
pub struct SqlBuffer {
    buf: String,
}

impl SqlBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a string fragment.
    pub fn append(&mut self, fragment: &str) {
        self.buf.push_str(fragment);
    }

    /// Append a single character.
    pub fn append_char(&mut self, c: char) {
        self.buf.push(c);
    }

    /// Append a signed integer.
    pub fn append_i64(&mut self, value: i64) {
        self.buf.push_str(&value.to_string());
    }

    /// Append an unsigned integer.
    pub fn append_u64(&mut self, value: u64) {
        self.buf.push_str(&value.to_string());
    }

    /// Append a double.
    pub fn append_f64(&mut self, value: f64) {
        self.buf.push_str(&value.to_string());
    }

    /// Whether any fragment has been appended.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the buffer and return the accumulated statement.
    ///
    /// Called exactly once per buffer.
    pub fn coalesce(self) -> String {
        self.buf
    }
}
