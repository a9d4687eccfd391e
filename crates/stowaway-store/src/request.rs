use serde::{Deserialize, Serialize};
use url::Url;

/// The request method, restricted to the set the cache distinguishes.
///
/// `GET` responses are the only ones shared between transactions. `POST` can
/// be cached when the caller supplies an upload identifier, and the remaining
/// methods never touch stored entries except to invalidate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// A safe, cacheable read.
    Get,
    /// Served from a `GET` entry when possible, but never written.
    Head,
    /// Cacheable only with an upload identifier.
    Post,
    /// Invalidates on success, never cached.
    Put,
    /// Invalidates on success, never cached.
    Delete,
    /// Invalidates on success, never cached.
    Patch,
}

impl Method {
    /// The canonical uppercase method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
        }
    }

    /// Whether a successful response to this method invalidates the cached
    /// `GET` variant of the same URL.
    pub fn invalidates_on_success(&self) -> bool {
        matches!(
            self,
            Method::Post | Method::Put | Method::Delete | Method::Patch
        )
    }
}

/// How the caller wants the cache involved in this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadMode {
    /// Read from the cache when possible, write when the response allows it.
    #[default]
    Normal,
    /// Serve only from the cache, never from the network.
    CacheOnly,
    /// Skip cache reads entirely and replace whatever is stored.
    BypassCache,
}

/// Relative scheduling priority of a transaction.
///
/// The engine only compares priorities; it attaches no meaning to the
/// individual levels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work, run when nothing else is waiting.
    Idle,
    /// Below normal.
    Low,
    /// The default for resource loads.
    #[default]
    Medium,
    /// Above normal.
    High,
    /// Latency critical.
    Highest,
}

/// A half-open byte interval `[start, end)` within a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    /// First byte of the interval.
    pub start: u64,
    /// One past the last byte of the interval.
    pub end: u64,
}

impl ByteRange {
    /// Creates the interval `[start, end)`.
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// The number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Whether the interval covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// The isolation partition a request belongs to.
///
/// The caller derives this from its notion of browsing context. The engine
/// never interprets the partition string; it only folds it into the cache key
/// when cache splitting is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionKey {
    /// Serialized partition identity, for example a top-frame site pair.
    pub key_string: String,
    /// Whether the request loads a document into a sub-frame.
    pub is_subframe_document: bool,
    /// Whether the request is a main-frame navigation initiated cross-site.
    pub is_cross_site_main_frame_navigation: bool,
}

impl PartitionKey {
    /// Creates a partition with both context markers cleared.
    pub fn new(key_string: impl Into<String>) -> Self {
        Self {
            key_string: key_string.into(),
            is_subframe_document: false,
            is_cross_site_main_frame_navigation: false,
        }
    }
}

/// Everything the engine needs to know about one request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Target URL. Fragments and embedded credentials are stripped during key
    /// generation.
    pub url: Url,
    /// Request method.
    pub method: Method,
    /// Cache involvement requested by the caller.
    pub load_mode: LoadMode,
    /// Scheduling priority, forwarded to network transactions.
    pub priority: Priority,
    /// Identifier of the upload body for `POST` requests. `POST` without an
    /// identifier is never keyed.
    pub upload_id: Option<i64>,
    /// Requested byte range, if this is a range request.
    pub range: Option<ByteRange>,
    /// Isolation partition, required when cache splitting is enabled. A
    /// request from an opaque or transient context carries `None` and is
    /// unkeyable under split configurations.
    pub partition_key: Option<PartitionKey>,
    /// Whether the request is sent with credentials. Only consulted when the
    /// credential split is enabled.
    pub include_credentials: bool,
    /// Extra request headers, such as conditional headers added during
    /// revalidation.
    pub extra_headers: Vec<(String, String)>,
}

impl RequestInfo {
    /// Creates a plain request with default load mode and priority.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            url,
            method,
            load_mode: LoadMode::default(),
            priority: Priority::default(),
            upload_id: None,
            range: None,
            partition_key: None,
            include_credentials: true,
            extra_headers: Vec::new(),
        }
    }

    /// Whether this request asks for a sub-range of the resource.
    pub fn is_range(&self) -> bool {
        self.range.is_some()
    }
}
