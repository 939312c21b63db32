//! Records delivered by source connectors

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Opaque resume position inside a source.
///
/// Only connectors interpret it. The run loop never persists it, so
/// delivery across process restarts depends on the connector variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(position: impl Into<String>) -> Self {
        Self(position.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for Cursor {
    fn from(offset: u64) -> Self {
        Self(offset.to_string())
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single record destined for a local topic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// Target local topic
    pub topic: String,
    /// Optional message key
    #[serde(serialize_with = "serialize_opt_bytes")]
    pub key: Option<Bytes>,
    /// Payload (opaque to the runtime)
    #[serde(serialize_with = "serialize_bytes")]
    pub value: Bytes,
    /// Message headers, in source order
    #[serde(serialize_with = "serialize_headers")]
    pub headers: Vec<(String, Bytes)>,
    /// Source timestamp (or generation time for synthetic records)
    pub timestamp: DateTime<Utc>,
    /// Position of this record in its source, when the source has one
    pub offset: Option<u64>,
}

impl Record {
    /// Create a keyless record timestamped now
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value: value.into(),
            headers: Vec::new(),
            timestamp: Utc::now(),
            offset: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Bytes counted by throughput accounting: key + value + headers
    pub fn size_bytes(&self) -> usize {
        let key = self.key.as_ref().map_or(0, Bytes::len);
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.len() + value.len())
            .sum();
        key + self.value.len() + headers
    }

    /// Payload as UTF-8 text, lossily
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

// Payloads are usually JSON; emit them as text and fall back to lossy UTF-8.
fn serialize_bytes<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(value))
}

fn serialize_opt_bytes<S: Serializer>(
    value: &Option<Bytes>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(bytes) => serializer.serialize_some(&*String::from_utf8_lossy(bytes)),
        None => serializer.serialize_none(),
    }
}

fn serialize_headers<S: Serializer>(
    headers: &[(String, Bytes)],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(headers.len()))?;
    for (name, value) in headers {
        map.serialize_entry(name, &*String::from_utf8_lossy(value))?;
    }
    map.end()
}
