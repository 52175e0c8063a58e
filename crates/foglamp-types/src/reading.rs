//! Wire types for reading ingest and purge results.

use serde::{Deserialize, Serialize};

/// A single telemetry sample as submitted by a south plugin or filter.
///
/// The storage engine assigns the row id and insertion timestamp; a
/// `Reading` only carries what the sensor side knows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    /// Logical source of the reading.
    pub asset_code: String,
    /// Sensor-side timestamp, `YYYY-MM-DD HH:MM:SS[.ffffff][±HH:MM]` or
    /// the literal `now()`. Stored verbatim after validation.
    pub user_ts: String,
    /// Optional opaque de-duplication key. Python senders pass the string
    /// `"None"` when absent; [`Reading::read_key`] normalises that.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_key: Option<String>,
    /// Datapoint name to datapoint value (integer, double or string).
    pub reading: serde_json::Value,
}

impl Reading {
    /// The read key with the Python `"None"` placeholder coerced to absent.
    pub fn read_key(&self) -> Option<&str> {
        match self.read_key.as_deref() {
            None | Some("None") => None,
            Some(key) => Some(key),
        }
    }
}

/// The append envelope: `{"readings": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendPayload {
    /// The readings to insert, in submission order.
    pub readings: Vec<Reading>,
}

/// Summary counters returned by a purge cycle.
///
/// Serialises with the storage service's camelCase wire keys:
/// `{"removed":N,"unsentPurged":U,"unsentRetained":R,"readings":K}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeResult {
    /// Rows deleted in this cycle.
    pub removed: u64,
    /// Rows deleted that the north-bound sender had not yet acknowledged.
    #[serde(rename = "unsentPurged")]
    pub unsent_purged: u64,
    /// Unacknowledged rows left in place.
    #[serde(rename = "unsentRetained")]
    pub unsent_retained: u64,
    /// Rows remaining in the readings table after the cycle.
    #[serde(rename = "readings")]
    pub readings_remaining: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrip() {
        let json = r#"{"readings":[
            {"asset_code":"A1","user_ts":"2019-01-11 15:45:01.123456+01:00",
             "read_key":"f1e0e3e4-7c44-11e9-8f9e-2a86e4085a59",
             "reading":{"x":1,"y":2.5}}]}"#;
        let payload: AppendPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.readings.len(), 1);
        let r = &payload.readings[0];
        assert_eq!(r.asset_code, "A1");
        assert_eq!(r.user_ts, "2019-01-11 15:45:01.123456+01:00");
        assert!(r.read_key().is_some());
        assert_eq!(r.reading["x"], 1);
    }

    #[test]
    fn test_read_key_none_literal() {
        let r = Reading {
            asset_code: "A1".into(),
            user_ts: "now()".into(),
            read_key: Some("None".into()),
            reading: serde_json::json!({}),
        };
        assert_eq!(r.read_key(), None);
    }

    #[test]
    fn test_read_key_missing() {
        let json = r#"{"asset_code":"A1","user_ts":"now()","reading":{}}"#;
        let r: Reading = serde_json::from_str(json).unwrap();
        assert_eq!(r.read_key(), None);
    }

    #[test]
    fn test_purge_result_wire_keys() {
        let result = PurgeResult {
            removed: 10,
            unsent_purged: 2,
            unsent_retained: 3,
            readings_remaining: 90,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["removed"], 10);
        assert_eq!(json["unsentPurged"], 2);
        assert_eq!(json["unsentRetained"], 3);
        assert_eq!(json["readings"], 90);
    }
}
