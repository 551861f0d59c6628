//! Requests handed to a region client.

use bytes::Bytes;
use tracing::trace;

use crate::batch::Batch;
use crate::error::{Result, RpcError};
use crate::protocol::{encode_frame, Action, RegionAction, RegionRef, RpcBody};
use crate::result::ResultHandle;

/// What a request carries.
#[derive(Debug)]
pub enum RequestKind {
    /// A single key-value operation.
    Action(Action),
    /// Several requests sent as one frame.
    Batch(Batch),
}

/// A frame ready for the wire.
#[derive(Debug, Clone)]
pub struct EncodedRpc {
    /// Complete frame, header included.
    pub frame: Bytes,
    /// True when the frame is a multi-action of two or more elements.
    pub multi: bool,
}

/// One unit of work for a region server.
///
/// Classification is fixed at construction: mutations start out bufferable,
/// reads and batches never are. The result handle is created lazily by
/// [`Request::result_handle`] and must exist before the request is
/// dispatched; batches get theirs up front.
#[derive(Debug)]
pub struct Request {
    kind: RequestKind,
    region: Option<RegionRef>,
    fail_fast: bool,
    bufferable: bool,
    result: Option<ResultHandle>,
}

impl Request {
    /// Creates a request for a single action.
    pub fn new(action: Action) -> Self {
        Self {
            bufferable: action.is_mutation(),
            kind: RequestKind::Action(action),
            region: None,
            fail_fast: false,
            result: None,
        }
    }

    /// Reads `family` of row `key`, or a single cell when `qualifier` is set.
    pub fn get(key: impl Into<Bytes>, family: impl Into<Bytes>, qualifier: Option<Bytes>) -> Self {
        Self::new(Action::Get {
            key: key.into(),
            family: family.into(),
            qualifier,
        })
    }

    /// Writes one cell.
    pub fn put(
        key: impl Into<Bytes>,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self::new(Action::Put {
            key: key.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            value: value.into(),
        })
    }

    /// Appends `value` to one cell.
    pub fn append(
        key: impl Into<Bytes>,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self::new(Action::Append {
            key: key.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            value: value.into(),
        })
    }

    /// Deletes a whole row.
    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self::new(Action::Delete {
            key: key.into(),
            family: None,
            qualifier: None,
        })
    }

    /// What the request carries.
    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match &self.kind {
            RequestKind::Action(action) => action.name(),
            RequestKind::Batch(_) => "multi",
        }
    }

    /// Returns true for an explicit batch.
    pub fn is_batch(&self) -> bool {
        matches!(self.kind, RequestKind::Batch(_))
    }

    /// Number of single actions the request resolves, batches counted
    /// through their elements.
    pub fn leaf_count(&self) -> usize {
        match &self.kind {
            RequestKind::Action(_) => 1,
            RequestKind::Batch(batch) => batch.requests().iter().map(Request::leaf_count).sum(),
        }
    }

    /// Whether the request may be folded into the connection's batch.
    pub fn is_bufferable(&self) -> bool {
        self.bufferable
    }

    /// Opts a mutation in or out of batching. Reads and batches stay
    /// unbufferable whatever is passed.
    pub fn set_bufferable(&mut self, bufferable: bool) {
        self.bufferable = bufferable && self.can_buffer();
    }

    fn can_buffer(&self) -> bool {
        match &self.kind {
            RequestKind::Action(action) => action.is_mutation(),
            RequestKind::Batch(_) => false,
        }
    }

    /// Region the request is addressed to, if already resolved.
    pub fn region(&self) -> Option<&RegionRef> {
        self.region.as_ref()
    }

    /// Attaches the region resolved by the lookup service.
    pub fn set_region(&mut self, region: RegionRef) {
        self.region = Some(region);
    }

    /// Builder form of [`Request::set_region`].
    pub fn with_region(mut self, region: RegionRef) -> Self {
        self.set_region(region);
        self
    }

    /// Whether a dead connection fails the request instead of rerouting it.
    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    /// When set, a dead connection fails the request instead of rerouting it.
    pub fn set_fail_fast(&mut self, fail_fast: bool) {
        self.fail_fast = fail_fast;
    }

    /// Returns the request's result handle, creating it on first use.
    pub fn result_handle(&mut self) -> ResultHandle {
        self.result.get_or_insert_with(ResultHandle::new).clone()
    }

    /// Returns true once [`Request::result_handle`] has been called.
    pub fn has_result_handle(&self) -> bool {
        self.result.is_some()
    }

    /// Resolves the request with a failure. A batch fails its pending
    /// elements first.
    pub fn fail(&self, err: RpcError) {
        if let RequestKind::Batch(batch) = &self.kind {
            for element in batch.requests() {
                element.fail(err.clone());
            }
        }
        self.complete(Err(err));
    }

    pub(crate) fn complete(&self, outcome: Result<Bytes>) {
        let Some(handle) = &self.result else {
            return;
        };
        let completed = match outcome {
            Ok(payload) => handle.fulfill(payload),
            Err(err) => handle.fail(err),
        };
        if completed.is_err() {
            trace!(kind = self.name(), "result already completed");
        }
    }

    pub(crate) fn region_action(&self) -> Option<RegionAction> {
        match &self.kind {
            RequestKind::Action(action) => Some(RegionAction {
                region: self.region.clone(),
                action: action.clone(),
            }),
            RequestKind::Batch(_) => None,
        }
    }

    /// Unwraps a batch request, handing a leaf back unchanged.
    pub(crate) fn into_batch(self) -> std::result::Result<Batch, Request> {
        let Request {
            kind,
            region,
            fail_fast,
            bufferable,
            result,
        } = self;
        match kind {
            RequestKind::Batch(batch) => Ok(batch),
            kind => Err(Request {
                kind,
                region,
                fail_fast,
                bufferable,
                result,
            }),
        }
    }

    /// Serializes the request into one frame tagged with `request_id`.
    pub fn encode(&self, request_id: u64) -> Result<EncodedRpc> {
        match &self.kind {
            RequestKind::Batch(batch) => batch.encode(request_id),
            RequestKind::Action(action) => {
                let body = RpcBody::Single(RegionAction {
                    region: self.region.clone(),
                    action: action.clone(),
                });
                Ok(EncodedRpc {
                    frame: encode_frame(request_id, &body)?,
                    multi: false,
                })
            }
        }
    }
}

impl From<Batch> for Request {
    fn from(batch: Batch) -> Self {
        Self {
            result: Some(batch.result_handle()),
            kind: RequestKind::Batch(batch),
            region: None,
            fail_fast: false,
            bufferable: false,
        }
    }
}
