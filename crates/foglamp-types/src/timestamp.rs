//! Validation of sensor timestamps.
//!
//! `user_ts` values are stored verbatim by the engine, so validation has to
//! happen at the ingest boundary. The accepted forms are
//! `YYYY-MM-DD HH:MM:SS`, optionally followed by a fraction of one to six
//! digits and optionally a `±HH:MM` offset, plus the literal `now()` which
//! selects the database's current time.

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::PrimitiveDateTime;

use crate::error::{ParseError, ParseResult};

/// The literal that selects the database's current time on insert.
pub const NOW_LITERAL: &str = "now()";

const DATE_TIME: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Check that a `user_ts` value is one of the accepted forms.
///
/// The value itself is never rewritten; callers insert it as supplied.
///
/// # Example
///
/// ```
/// use foglamp_types::validate_user_ts;
///
/// assert!(validate_user_ts("2019-01-11 15:45:01.123456+01:00").is_ok());
/// assert!(validate_user_ts("2019-01-11 15:45:01").is_ok());
/// assert!(validate_user_ts("now()").is_ok());
/// assert!(validate_user_ts("last tuesday").is_err());
/// ```
pub fn validate_user_ts(value: &str) -> ParseResult<()> {
    if value == NOW_LITERAL {
        return Ok(());
    }
    if !value.is_ascii() || value.len() < 19 {
        return Err(ParseError::InvalidTimestamp(value.to_string()));
    }

    let (base, mut rest) = value.split_at(19);
    PrimitiveDateTime::parse(base, DATE_TIME)
        .map_err(|_| ParseError::InvalidTimestamp(value.to_string()))?;

    if let Some(frac) = rest.strip_prefix('.') {
        let digits = frac.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 || digits > 6 {
            return Err(ParseError::InvalidTimestamp(value.to_string()));
        }
        rest = &frac[digits..];
    }

    if rest.is_empty() {
        return Ok(());
    }
    validate_offset(rest).ok_or_else(|| ParseError::InvalidTimestamp(value.to_string()))
}

/// Validate a `±HH:MM` offset suffix.
fn validate_offset(s: &str) -> Option<()> {
    let digits = s.strip_prefix('+').or_else(|| s.strip_prefix('-'))?;
    let (hours, minutes) = digits.split_once(':')?;
    if hours.len() != 2 || minutes.len() != 2 {
        return None;
    }
    let h: u8 = hours.parse().ok()?;
    let m: u8 = minutes.parse().ok()?;
    (h <= 23 && m <= 59).then_some(())
}
