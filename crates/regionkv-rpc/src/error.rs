use thiserror::Error;

/// Errors surfaced by the dispatch layer, either synchronously from
/// [`RegionClient::dispatch`](crate::region_client::RegionClient::dispatch)
/// or asynchronously through a [`ResultHandle`](crate::result::ResultHandle).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// A leaf request reached dispatch without a result handle.
    #[error("{kind} request dispatched before its result handle was obtained")]
    UninitializedResult {
        /// Short name of the offending request.
        kind: &'static str,
    },

    /// The connection died and the request could not be rerouted.
    #[error("connection reset to {server}")]
    ConnectionReset {
        /// Server the connection pointed at.
        server: String,
    },

    /// An empty batch was serialized.
    #[error("nothing to serialize: batch is empty")]
    MissingPayload,

    /// Operation refused because the connection is dead.
    #[error("connection to {server} is dead")]
    ConnectionDead {
        /// Server the connection pointed at.
        server: String,
    },

    /// A result handle was resolved twice.
    #[error("result handle already completed")]
    AlreadyCompleted,

    /// No outcome arrived in time.
    #[error("timed out after {timeout_ms}ms waiting for result")]
    Timeout {
        /// How long the caller waited.
        timeout_ms: u64,
    },

    /// A response named a request id that is not in flight.
    #[error("no in-flight request with id {request_id}")]
    UnknownRequest {
        /// Id carried by the response.
        request_id: u64,
    },

    /// The channel no longer accepts writes.
    #[error("channel closed")]
    ChannelClosed,

    /// A frame or response failed validation.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What was wrong with it.
        reason: String,
    },

    /// bincode failed to encode or decode a body.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The server answered with an error.
    #[error("remote error: {0}")]
    Remote(String),
}

impl RpcError {
    /// Returns true for failures caused by losing the server connection.
    pub fn is_connection_reset(&self) -> bool {
        matches!(self, RpcError::ConnectionReset { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;
