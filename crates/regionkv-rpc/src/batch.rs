//! Batches of requests sent to one region server as a single frame.
//!
//! Connections accumulate bufferable writes into a [`Batch`] until it is
//! flushed; callers may also build one explicitly and dispatch it through
//! `Request::from(batch)`. A batch of one is sent as its only element.

use tracing::trace;

use crate::error::{Result, RpcError};
use crate::protocol::{encode_frame, RpcBody};
use crate::request::{EncodedRpc, Request};
use crate::result::ResultHandle;

/// Ordered collection of requests sharing one result handle.
#[derive(Debug)]
pub struct Batch {
    requests: Vec<Request>,
    result: ResultHandle,
}

impl Batch {
    /// Creates an empty batch with its result handle already initialized.
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
            result: ResultHandle::new(),
        }
    }

    /// Appends a request. Arrival order is kept on the wire.
    pub fn add(&mut self, request: Request) {
        self.requests.push(request);
    }

    /// Returns the number of requests in the batch.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Returns true if the batch holds no requests.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Requests in submission order.
    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    /// Consumes the batch, returning its requests in submission order.
    pub fn into_requests(self) -> Vec<Request> {
        self.requests
    }

    /// Handle resolved when the whole batch completes.
    pub fn result_handle(&self) -> ResultHandle {
        self.result.clone()
    }

    /// Serializes the batch.
    ///
    /// An empty batch has nothing to send and fails with
    /// [`RpcError::MissingPayload`]. A single element is encoded on its own
    /// and is not reported as multi.
    pub fn encode(&self, request_id: u64) -> Result<EncodedRpc> {
        match self.requests.as_slice() {
            [] => Err(RpcError::MissingPayload),
            [single] => {
                trace!(request_id, kind = single.name(), "flattening single-element batch");
                single.encode(request_id)
            }
            many => {
                let actions = many
                    .iter()
                    .map(|request| {
                        request.region_action().ok_or_else(|| RpcError::InvalidFrame {
                            reason: "nested batch".to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(EncodedRpc {
                    frame: encode_frame(request_id, &RpcBody::Multi(actions))?,
                    multi: true,
                })
            }
        }
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}
