//! Default datetime formatting applied while mapping result rows.
//!
//! Queries that name a datetime column through an expression get their
//! formatting in SQL; everything else is caught here, at row-mapping time,
//! so callers always see the engine's canonical datetime text.

use rusqlite::Connection;

/// Date format: 24h clock, whole seconds.
pub const F_DATEH24_SEC: &str = "%Y-%m-%d %H:%M:%S";
/// Date format: 24h clock, fractional seconds.
pub const F_DATEH24_MS: &str = "%Y-%m-%d %H:%M:%f";

/// Length of the full microseconds-plus-offset `user_ts` form,
/// e.g. `2019-01-11 15:45:01.123456+01:00`.
const USER_TS_FULL_LEN: usize = 32;

/// Apply the engine's default datetime formatting to one column value.
///
/// Two cases trigger a reformat, both executed through SQLite itself:
///
/// 1. A raw readings `user_ts` in its full 32-character form: reformatted
///    to whole seconds with the microseconds (and any trailing offset
///    text) re-attached via `substr`.
/// 2. A plain column whose declared type is the engine's DATETIME synonym
///    (expressions and aliases report no declared type, so anything the
///    caller formatted or renamed passes through): reformatted with
///    fractional seconds.
///
/// Returns `None` when no formatting applies. Lookup failures are soft:
/// the error is logged and the raw text is kept.
pub(crate) fn apply_column_datetime_format(
    conn: &Connection,
    column_name: &str,
    decl_type: Option<&str>,
    text: &str,
) -> Option<String> {
    let format_sql = if column_name == "user_ts" && text.len() == USER_TS_FULL_LEN {
        format!("SELECT strftime('{F_DATEH24_SEC}', ?1) || substr(?1, instr(?1, '.'), 7)")
    } else if decl_type.is_some_and(|t| t.eq_ignore_ascii_case(crate::schema::DATETIME_TYPE)) {
        format!("SELECT strftime('{F_DATEH24_MS}', ?1)")
    } else {
        return None;
    };

    match conn.query_row(&format_sql, [text], |row| row.get::<_, Option<String>>(0)) {
        Ok(Some(formatted)) => Some(formatted),
        Ok(None) => {
            // Not parseable as a datetime; keep the raw text.
            tracing::debug!(column = column_name, value = text, "datetime format skipped");
            None
        }
        Err(e) => {
            tracing::error!(column = column_name, error = %e, "SELECT dateformat failed");
            None
        }
    }
}
