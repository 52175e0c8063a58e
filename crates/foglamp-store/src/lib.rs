//! SQLite-backed storage engine for FogLAMP readings.
//!
//! This crate implements the storage service's hard core: a concurrent
//! append/query/purge pipeline over a single embedded database.
//!
//! # Features
//!
//! - Batched reading ingest with per-element timestamp validation
//! - A JSON query DSL compiled to parameterised SQL
//! - Block fetch for the north-bound sender
//! - Age- and size-driven purge with an adaptive, self-tuning block size
//! - Default datetime formatting with sub-second `user_ts` preservation
//!
//! # Example
//!
//! ```no_run
//! use foglamp_store::ReadingsStore;
//!
//! let store = ReadingsStore::open_default()?;
//! let set = store.retrieve_readings(
//!     r#"{"where":{"column":"asset_code","condition":"=","value":"pump1"},
//!         "limit":10}"#,
//! )?;
//! println!("{set}");
//! # Ok::<(), foglamp_store::Error>(())
//! ```

mod buffer;
mod compiler;
mod dsl;
mod error;
mod format;
mod gate;
mod purge;
mod schema;
mod store;

pub use buffer::SqlBuffer;
pub use compiler::{
    compile_append, compile_delete, compile_retrieve, compile_retrieve_readings, CompiledSql,
};
pub use dsl::{
    Aggregate, BucketSize, Condition, Group, JsonSelector, OneOrMany, Properties, Query,
    ReturnColumn, Scalar, Sort, TimeBucket, Where, WhereNode,
};
pub use error::{Error, Result};
pub use gate::{AdaptiveBlockSizer, BlockSizer};
pub use purge::FLAG_RETAIN_UNSENT;
pub use store::ReadingsStore;

/// Default database path: `foglamp.sqlite` under the platform data
/// directory.
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("foglamp")
        .join("foglamp.sqlite")
}
