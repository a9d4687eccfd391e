use crate::{ByteRange, RequestInfo, ResponseHead, StoredRecord};

/// What to do with a stored record before serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredVerdict {
    /// Serve the stored response as is.
    Fresh,
    /// Ask the origin whether the stored response is still valid, sending the
    /// given conditional headers.
    Revalidate {
        /// Conditional headers to merge into the outgoing request.
        extra_headers: Vec<(String, String)>,
    },
    /// The stored response is unusable; fetch a replacement.
    Refetch,
}

/// How a network response relates to the record it was validated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseVerdict {
    /// The origin confirmed the stored response. `updated` is the stored head
    /// with refreshed headers and timestamps, ready to be rewritten.
    NotModified {
        /// Merged head to persist in place of the stored one.
        updated: ResponseHead,
    },
    /// The response supersedes whatever is stored.
    Replaces {
        /// Whether the new response may be written to the cache.
        cacheable: bool,
    },
}

/// One step of a range-request execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSegment {
    /// Bytes already present in the entry's body stream.
    Store(ByteRange),
    /// Bytes that must be fetched from the origin.
    Network(ByteRange),
}

impl RangeSegment {
    /// The interval this segment covers.
    pub fn range(&self) -> ByteRange {
        match *self {
            RangeSegment::Store(r) | RangeSegment::Network(r) => r,
        }
    }
}

/// HTTP semantics, supplied by the caller.
///
/// The engine sequences transactions but deliberately understands no header
/// freshness rules. Every judgement call about response meaning is routed
/// through this trait, which keeps the coordination rules testable with
/// scripted policies.
pub trait HttpPolicy: Send + Sync {
    /// Judges a stored record found for `request`.
    fn evaluate_stored(&self, request: &RequestInfo, record: &StoredRecord) -> StoredVerdict;

    /// Classifies a freshly received response head. `stored` is present when
    /// the fetch was a validation of an existing record.
    fn classify_response(
        &self,
        request: &RequestInfo,
        stored: Option<&ResponseHead>,
        response: &ResponseHead,
    ) -> ResponseVerdict;

    /// Splits a range request into stored and missing intervals, given the
    /// intervals recorded in the entry.
    ///
    /// The default plan fetches the whole requested range from the network.
    fn plan_range(&self, request: &RequestInfo, record: &StoredRecord) -> Vec<RangeSegment> {
        let _ = record;
        match request.range {
            Some(range) if !range.is_empty() => vec![RangeSegment::Network(range)],
            _ => Vec::new(),
        }
    }
}
