//! Event model and wire payload envelopes
//!
//! ## Timestamp format
//!
//! The ingestion service expects millisecond timestamps serialized as decimal
//! strings in `timestamp` fields, for regular and snapshot events alike. This
//! is a server-compatibility requirement, so [`Event`] always writes strings
//! and tolerates both strings and integers when re-parsing queued JSON.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Library identity reported in every event's properties
pub const LIB_NAME: &str = "posthog-flutter";
/// Library version reported in every event's properties
pub const LIB_VERSION: &str = "5.9.0";

/// Fallback distinct id when none can be resolved
pub const UNKNOWN_USER: &str = "unknown_user";
/// Fallback session id when none can be resolved
pub const UNKNOWN_SESSION: &str = "unknown_session";

/// Current epoch time in milliseconds
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A single analytics event
///
/// Immutable once constructed; queued as serialized JSON and removed only
/// after the server acknowledged the batch containing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event name (never empty on the wire)
    pub event: String,
    /// Identity the event belongs to (never empty on the wire)
    pub distinct_id: String,
    /// Capture time, epoch milliseconds
    #[serde(with = "ts_string")]
    pub timestamp: i64,
    /// Free-form JSON property tree
    pub properties: Value,
}

/// Capture batch envelope: `{"api_key": ..., "batch": [...]}`
#[derive(Debug, Serialize)]
pub struct CaptureBatch<'a> {
    pub api_key: &'a str,
    pub batch: Vec<Event>,
}

/// Decide request envelope: `{"api_key": ..., "distinct_id": ..., "properties": {...}}`
#[derive(Debug, Serialize)]
pub struct DecideRequest<'a> {
    pub api_key: &'a str,
    pub distinct_id: &'a str,
    pub properties: &'a Value,
}

/// Millisecond timestamps as decimal strings on the wire
pub mod ts_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &i64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(i64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Num(n) => Ok(n),
            Repr::Text(t) => t.parse().map_err(serde::de::Error::custom),
        }
    }
}
