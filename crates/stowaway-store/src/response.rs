use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ByteRange;

/// Stream index holding the serialized [`StoredRecord`].
pub const STREAM_RESPONSE_HEAD: u32 = 0;
/// Stream index holding the response body bytes.
pub const STREAM_RESPONSE_BODY: u32 = 1;
/// Stream index reserved for out-of-band metadata. Never reassigned, so that
/// records written by older builds keep their layout.
pub const STREAM_RESERVED: u32 = 2;

/// The parsed response head, reduced to what coordination decisions need.
///
/// The engine treats the header list as opaque payload. The boolean digests
/// are computed by the caller from the full response and drive the
/// truncation and writer-sharing rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    /// HTTP status code.
    pub status: u16,
    /// Response headers in wire order.
    pub headers: Vec<(String, String)>,
    /// When the request that produced this response was sent.
    pub request_time: DateTime<Utc>,
    /// When the response head was received.
    pub response_time: DateTime<Utc>,
    /// Declared body length, when the response carried one.
    pub content_length: Option<u64>,
    /// Whether the response carries validators strong enough to resume an
    /// interrupted download.
    pub has_strong_validators: bool,
    /// Whether the origin accepts byte-range requests for this resource.
    pub accepts_byte_ranges: bool,
    /// Whether the response forbids storage.
    pub no_store: bool,
}

impl ResponseHead {
    /// Whether the status code is below the client-error range.
    pub fn is_success(&self) -> bool {
        self.status < 400
    }
}

/// The envelope persisted in [`STREAM_RESPONSE_HEAD`] of every entry.
///
/// A record with `truncated` set describes an incomplete body stream: an
/// interrupted prefix download, or a sparse entry assembled from range
/// fetches. `ranges` then lists the intervals of the body stream that
/// contain valid bytes. Complete bodies clear `truncated` and leave `ranges`
/// empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Whether the body stream is incomplete (a resumable prefix or a
    /// sparse set of ranges).
    #[serde(default)]
    pub truncated: bool,
    /// Valid intervals of the body stream for sparse (range) entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<ByteRange>,
    /// The response head this entry was stored under.
    pub head: ResponseHead,
}

impl StoredRecord {
    /// Creates a record describing a complete body for `head`.
    pub fn complete(head: ResponseHead) -> Self {
        Self {
            truncated: false,
            ranges: Vec::new(),
            head,
        }
    }

    /// Serializes the record for [`STREAM_RESPONSE_HEAD`].
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Parses a record previously written with [`StoredRecord::encode`].
    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head() -> ResponseHead {
        ResponseHead {
            status: 200,
            headers: vec![("etag".into(), "\"abc\"".into())],
            request_time: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            response_time: DateTime::from_timestamp(1_700_000_001, 0).unwrap(),
            content_length: Some(128),
            has_strong_validators: true,
            accepts_byte_ranges: true,
            no_store: false,
        }
    }

    #[test]
    fn record_round_trips() {
        let record = StoredRecord {
            truncated: true,
            ranges: vec![ByteRange::new(0, 64)],
            head: head(),
        };
        let parsed = StoredRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn complete_record_omits_ranges() {
        let encoded = StoredRecord::complete(head()).encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert!(json.get("ranges").is_none());
        assert_eq!(json["truncated"], false);
    }
}
