//! The readings store.
//!
//! # Concurrency model
//!
//! The engine owns a single write handle, opened in WAL mode and guarded
//! by the store's own mutex: every write (append, generic delete, purge
//! delete block) runs exclusively. Readers never take that mutex; each
//! read checks an idle read handle out of a small pool (opening another
//! handle to the same database when none is idle), so reads proceed
//! concurrently with each other and with writes. Writers additionally
//! register on the [`WriteGate`] so the purge loop can yield to in-flight
//! appends between delete blocks.
//!
//! Statements that find the database busy or locked retry with a linear
//! backoff of `100·attempt` ms for up to 40 attempts before surfacing
//! [`Error::BusyExhausted`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};
use tracing::{debug, info};

use foglamp_types::AppendPayload;

use crate::compiler::{
    compile_append, compile_delete, compile_retrieve, compile_retrieve_readings, CompiledSql,
};
use crate::dsl::Query;
use crate::error::{Error, Result};
use crate::format::apply_column_datetime_format;
use crate::gate::{AdaptiveBlockSizer, BlockSizer, WriteGate, PURGE_DELETE_BLOCK_SIZE};
use crate::schema;

/// Maximum number of retries when a lock is encountered.
const MAX_RETRIES: u32 = 40;
/// Multiplier to back off a retry on lock, in milliseconds.
const RETRY_BACKOFF_MS: u64 = 100;

/// Where the database lives; read handles are opened against this.
#[derive(Debug, Clone)]
enum DbLocation {
    File(PathBuf),
    /// Shared-cache URI so every handle sees the same in-memory database.
    Memory(String),
}

/// SQLite-backed store for telemetry readings.
///
/// The store owns its database handles for the process lifetime: created
/// at startup, closed when the store drops. Readings are created by
/// append, never mutated, and destroyed only by purge.
///
/// # Example
///
/// ```
/// use foglamp_store::ReadingsStore;
///
/// let store = ReadingsStore::open_in_memory()?;
/// store.append_readings(
///     r#"{"readings":[{"asset_code":"pump1",
///         "user_ts":"2024-01-02 03:04:05.678901+00:00",
///         "reading":{"rpm":1207}}]}"#,
/// )?;
/// let set = store.retrieve_readings("{}")?;
/// assert_eq!(set["count"], 1);
/// # Ok::<(), foglamp_store::Error>(())
/// ```
pub struct ReadingsStore {
    location: DbLocation,
    /// The single write handle; the mutex wraps each write.
    pub(crate) writer: Mutex<Connection>,
    /// Idle read handles, grown on demand. Readers never touch `writer`.
    readers: Mutex<Vec<Connection>>,
    pub(crate) gate: WriteGate,
    pub(crate) sizer: Mutex<Box<dyn BlockSizer>>,
    /// Block size carried over between purge cycles.
    pub(crate) last_block_size: AtomicU64,
}

impl ReadingsStore {
    /// Open or create a database at the given path.
    ///
    /// Creates parent directories if they don't exist. The database is
    /// initialized with WAL mode for better concurrent read performance.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Internal(format!("create {}: {e}", parent.display())))?;
            }
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        Self::from_connection(DbLocation::File(path.to_path_buf()), conn)
    }

    /// Open the database at the platform default location
    /// (`<data dir>/foglamp/foglamp.sqlite`).
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database. Useful for tests; data is lost when the
    /// store is dropped.
    pub fn open_in_memory() -> Result<Self> {
        static NEXT_MEMORY_DB: AtomicU64 = AtomicU64::new(0);
        let uri = format!(
            "file:foglamp_mem_{}?mode=memory&cache=shared",
            NEXT_MEMORY_DB.fetch_add(1, Ordering::Relaxed)
        );
        let conn = Connection::open(&uri)?;
        Self::from_connection(DbLocation::Memory(uri), conn)
    }

    fn from_connection(location: DbLocation, conn: Connection) -> Result<Self> {
        schema::initialize(&conn)?;
        Ok(Self {
            location,
            writer: Mutex::new(conn),
            readers: Mutex::new(Vec::new()),
            gate: WriteGate::default(),
            sizer: Mutex::new(Box::new(AdaptiveBlockSizer::new())),
            last_block_size: AtomicU64::new(PURGE_DELETE_BLOCK_SIZE),
        })
    }

    /// Check an idle read handle out of the pool, opening a fresh one when
    /// every handle is in use.
    fn checkout_reader(&self) -> Result<Connection> {
        if let Some(conn) = self.readers.lock().unwrap().pop() {
            return Ok(conn);
        }
        let conn = match &self.location {
            DbLocation::File(path) => Connection::open(path)?,
            DbLocation::Memory(uri) => Connection::open(uri)?,
        };
        Ok(conn)
    }

    fn checkin_reader(&self, conn: Connection) {
        self.readers.lock().unwrap().push(conn);
    }

    /// Replace the purge block-size controller. Tests use this to drive
    /// the delete loop with a synthetic policy.
    pub fn with_block_sizer(mut self, sizer: Box<dyn BlockSizer>) -> Self {
        self.sizer = Mutex::new(sizer);
        self
    }

    // === Readings operations ===

    /// Append a batch of readings from the JSON envelope
    /// `{"readings":[{asset_code, user_ts, read_key?, reading}, ...]}`.
    ///
    /// Elements with an invalid `user_ts` are skipped with a logged error;
    /// the rest are inserted in one multi-row statement. Returns the
    /// number of rows actually inserted.
    pub fn append_readings(&self, payload: &str) -> Result<usize> {
        let payload: AppendPayload = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(operation = "appendReadings", error = %e, "payload rejected");
            Error::Parse(e)
        })?;
        let (compiled, rows) = compile_append(&payload)?;
        if rows == 0 {
            return Ok(0);
        }
        self.execute_write("ReadingsAppend", &compiled)
    }

    /// Fetch a block of readings for the north-bound sender: up to
    /// `blksize` rows with `id >= start`, ordered ascending, timestamps
    /// formatted in UTC.
    pub fn fetch_readings(&self, start: u64, blksize: u32) -> Result<Value> {
        let compiled = CompiledSql {
            sql: "SELECT id, asset_code, read_key, reading, \
                  strftime('%Y-%m-%d %H:%M:%S', user_ts, 'utc') \
                  || substr(user_ts, instr(user_ts, '.'), 7) AS user_ts, \
                  strftime('%Y-%m-%d %H:%M:%f', ts, 'utc') AS ts \
                  FROM readings WHERE id >= ?1 ORDER BY id ASC LIMIT ?2;"
                .to_string(),
            params: vec![(start as i64).into(), i64::from(blksize).into()],
        };
        self.execute_query("ReadingsFetch", &compiled)
    }

    /// Run a query document against the readings table. An empty document
    /// selects all rows with the default localtime projection.
    pub fn retrieve_readings(&self, condition: &str) -> Result<Value> {
        let query = if condition.trim().is_empty() {
            Query::default()
        } else {
            Query::parse(condition)?
        };
        let compiled = compile_retrieve_readings(&query)?;
        self.execute_query("ReadingsRetrieve", &compiled)
    }

    // === Generic table operations ===

    /// Run a query document against a generic table.
    pub fn query_table(&self, table: &str, condition: &str) -> Result<Value> {
        let query = if condition.trim().is_empty() {
            Query::default()
        } else {
            Query::parse(condition)?
        };
        let compiled = compile_retrieve(table, &query)?;
        self.execute_query("CommonRetrieve", &compiled)
    }

    /// Delete rows from a generic table. An empty condition deletes all
    /// rows; a non-empty document must carry a where clause.
    pub fn delete_from(&self, table: &str, condition: &str) -> Result<usize> {
        let query = if condition.trim().is_empty() {
            Query::default()
        } else {
            let query = Query::parse(condition)?;
            if query.condition.is_none() {
                return Err(Error::shape("delete", "JSON does not contain where clause"));
            }
            query
        };
        let compiled = compile_delete(table, &query)?;
        self.execute_write("CommonDelete", &compiled)
    }

    // === Plumbing ===

    /// Execute a write statement on the write handle, under its mutex and
    /// the write gate, returning the number of affected rows.
    pub(crate) fn execute_write(&self, operation: &'static str, compiled: &CompiledSql) -> Result<usize> {
        debug!(operation, sql = %compiled.sql, "executing");
        let _writer = self.gate.begin_write();
        let conn = self.writer.lock().unwrap();
        retry_on_busy(operation, || {
            conn.execute(&compiled.sql, params_from_iter(compiled.params.iter()))
        })
    }

    /// Execute a read statement on a read handle and map the rows into the
    /// result-set JSON. Never touches the write mutex.
    pub(crate) fn execute_query(&self, operation: &'static str, compiled: &CompiledSql) -> Result<Value> {
        debug!(operation, sql = %compiled.sql, "executing");
        let conn = self.checkout_reader()?;
        let result = retry_on_busy(operation, || map_result_set(&conn, compiled));
        self.checkin_reader(conn);
        result
    }

    /// Run a scalar query returning a single optional value, with busy
    /// retries. Used by the purge locator.
    pub(crate) fn query_scalar(
        &self,
        operation: &'static str,
        sql: &str,
        params: &[rusqlite::types::Value],
    ) -> Result<Option<i64>> {
        let conn = self.checkout_reader()?;
        let result = retry_on_busy(operation, || {
            conn.query_row(sql, params_from_iter(params.iter()), |row| {
                row.get::<_, Option<i64>>(0)
            })
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        });
        self.checkin_reader(conn);
        result
    }
}

/// Map a result set into `{"count": N, "rows": [...]}`.
///
/// NULL becomes the empty string, numeric columns stay JSON numbers, and
/// text that parses as a JSON object or array is embedded structurally.
/// Text columns run through the default datetime formatter first.
fn map_result_set(conn: &Connection, compiled: &CompiledSql) -> rusqlite::Result<Value> {
    let mut stmt = conn.prepare(&compiled.sql)?;
    let columns: Vec<(String, Option<String>)> = stmt
        .columns()
        .iter()
        .map(|c| (c.name().to_string(), c.decl_type().map(str::to_string)))
        .collect();

    let mut out = Vec::new();
    let mut rows = stmt.query(params_from_iter(compiled.params.iter()))?;
    while let Some(row) = rows.next()? {
        let mut object = serde_json::Map::with_capacity(columns.len());
        for (i, (name, decl_type)) in columns.iter().enumerate() {
            let value = match row.get_ref(i)? {
                ValueRef::Null => json!(""),
                ValueRef::Integer(v) => json!(v),
                ValueRef::Real(v) => json!(v),
                ValueRef::Text(bytes) => {
                    let text = String::from_utf8_lossy(bytes);
                    let text =
                        apply_column_datetime_format(conn, name, decl_type.as_deref(), &text)
                            .unwrap_or_else(|| text.into_owned());
                    match serde_json::from_str::<Value>(&text) {
                        // Structured documents are embedded; numeric-looking
                        // text stays a string.
                        Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
                        _ => Value::String(text),
                    }
                }
                ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            };
            object.insert(name.clone(), value);
        }
        out.push(Value::Object(object));
    }

    Ok(json!({ "count": out.len(), "rows": out }))
}

fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(error, rusqlite::Error::SqliteFailure(e, _)
        if e.code == rusqlite::ErrorCode::DatabaseBusy
            || e.code == rusqlite::ErrorCode::DatabaseLocked)
}

/// Run a statement, retrying while the database reports busy or locked.
pub(crate) fn retry_on_busy<T>(
    operation: &'static str,
    mut statement: impl FnMut() -> rusqlite::Result<T>,
) -> Result<T> {
    let mut attempt: u32 = 0;
    loop {
        match statement() {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if is_busy(&e) => {
                attempt += 1;
                if attempt >= MAX_RETRIES {
                    tracing::error!(operation, attempts = attempt, "database stayed busy");
                    return Err(Error::BusyExhausted { attempts: attempt });
                }
                std::thread::sleep(Duration::from_millis(RETRY_BACKOFF_MS * u64::from(attempt)));
            }
            Err(e) => {
                tracing::error!(operation, error = %e, "SQL statement failed");
                return Err(e.into());
            }
        }
    }
}
