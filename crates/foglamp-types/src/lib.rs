//! Platform-agnostic types for the FogLAMP storage service.
//!
//! This crate provides the shared wire types exchanged between the storage
//! engine, the north-bound sending process and the filter plugins:
//!
//! - The append payload (`{"readings": [...]}`) and its elements
//! - The purge result summary
//! - Validation of sensor timestamps (`user_ts`)
//!
//! # Example
//!
//! ```
//! use foglamp_types::{AppendPayload, validate_user_ts};
//!
//! let payload: AppendPayload = serde_json::from_str(
//!     r#"{"readings":[{"asset_code":"pump1",
//!         "user_ts":"2024-01-02 03:04:05.678901+00:00",
//!         "reading":{"rpm":1207}}]}"#,
//! ).unwrap();
//! assert_eq!(payload.readings.len(), 1);
//! assert!(validate_user_ts(&payload.readings[0].user_ts).is_ok());
//! ```

pub mod error;
pub mod reading;
pub mod timestamp;

pub use error::{ParseError, ParseResult};
pub use reading::{AppendPayload, PurgeResult, Reading};
pub use timestamp::{validate_user_ts, NOW_LITERAL};
