//! Readings handed to the client by the host
//!
//! A reading is immutable once built: an asset code, a UTC timestamp and an
//! ordered set of named datapoints. Datapoint order is insertion order and is
//! preserved all the way into the published payload.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Textual timestamp form used in payloads, e.g. `2024-05-01 12:00:00.250000+00:00`
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f+00:00";

/// Payload key carrying the reading timestamp
pub const TIMESTAMP_KEY: &str = "ts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    asset_code: String,
    #[serde(with = "user_ts")]
    user_ts: DateTime<Utc>,
    #[serde(default)]
    reading: Map<String, Value>,
}

impl Reading {
    pub fn new(asset_code: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            asset_code: asset_code.into(),
            user_ts: timestamp,
            reading: Map::new(),
        }
    }

    /// Append a datapoint. A repeated name replaces the earlier value in place.
    pub fn with_datapoint(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.reading.insert(name.into(), value.into());
        self
    }

    pub fn asset_code(&self) -> &str {
        &self.asset_code
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.user_ts
    }

    pub fn datapoints(&self) -> &Map<String, Value> {
        &self.reading
    }

    pub fn formatted_timestamp(&self) -> String {
        format_timestamp(&self.user_ts)
    }

    /// Per-reading payload object: `{"ts": ..., <datapoints in order>}`
    ///
    /// `ts` always holds the reading timestamp. A datapoint that is itself
    /// named `ts` is kept under the first free `_ts`, `__ts`, ... name.
    pub fn to_payload_object(&self) -> Value {
        let mut object = Map::with_capacity(self.reading.len() + 1);
        object.insert(TIMESTAMP_KEY.to_string(), Value::String(self.formatted_timestamp()));
        for (name, value) in &self.reading {
            if name == TIMESTAMP_KEY {
                let renamed = self.free_timestamp_alias();
                debug!(asset = %self.asset_code, renamed = %renamed, "Datapoint named ts renamed");
                object.insert(renamed, value.clone());
            } else {
                object.insert(name.clone(), value.clone());
            }
        }
        Value::Object(object)
    }

    fn free_timestamp_alias(&self) -> String {
        let mut alias = format!("_{TIMESTAMP_KEY}");
        while self.reading.contains_key(&alias) {
            alias.insert(0, '_');
        }
        alias
    }
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// Accepts RFC 3339 as well as the payload form with a space separator
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%:z"))
        .map(|ts| ts.with_timezone(&Utc))
        .or_else(|err| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .map(|naive| naive.and_utc())
                .map_err(|_| err)
        })
}

mod user_ts {
    use super::{format_timestamp, parse_timestamp};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_timestamp(&text).map_err(serde::de::Error::custom)
    }
}
