use async_trait::async_trait;
use bytes::Bytes;

use crate::{Priority, RequestInfo, ResponseHead};

/// Failures reported by the network layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// The request timed out.
    #[error("network timeout")]
    Timeout,
    /// The connection was closed mid-response.
    #[error("connection reset")]
    ConnectionReset,
    /// Any other transport failure.
    #[error("network failure: {0}")]
    Failed(String),
}

/// A single request/response exchange against the origin.
///
/// A transaction is single-use: started once, then drained by repeated
/// `read` calls until an empty buffer signals the end of the body. Inside a
/// writer group the transaction is owned by the group and survives the
/// departure of the member that created it.
#[async_trait]
pub trait NetworkTransaction: Send {
    /// Sends the request and waits for the response head.
    async fn start(&mut self, request: &RequestInfo) -> Result<(), NetworkError>;

    /// The response head received by [`NetworkTransaction::start`].
    fn response_head(&self) -> Option<&ResponseHead>;

    /// Reads up to `max_len` body bytes. An empty buffer means the body is
    /// complete.
    async fn read(&mut self, max_len: usize) -> Result<Bytes, NetworkError>;

    /// Adjusts the scheduling priority mid-flight, for example when a writer
    /// group inherits a more urgent member.
    fn set_priority(&mut self, priority: Priority);
}

/// Constructs network transactions for the engine.
pub trait CreateNetworkTransaction: Send + Sync {
    /// Creates an unstarted transaction at the given priority.
    fn create_transaction(&self, priority: Priority) -> Box<dyn NetworkTransaction>;
}
