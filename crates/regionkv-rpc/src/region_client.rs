//! Per-server connection state and request admission.
//!
//! A [`RegionClient`] owns the channel to one region server. Every request
//! handed to [`RegionClient::dispatch`] is, in this order of precedence:
//!
//! - rerouted through the owning client or failed, if the connection is dead
//! - queued until a channel is attached, if the connection is still coming up
//! - folded into the current batch, if it is bufferable and batching is on
//! - encoded and written to the channel otherwise
//!
//! All connection state sits behind one mutex. Rerouting and completing
//! result handles happen after it is released.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::batch::Batch;
use crate::channel::Channel;
use crate::error::{Result, RpcError};
use crate::request::{Request, RequestKind};
use crate::reroute::Reroute;
use crate::result::RpcResult;
use crate::stats::{ClientStats, StatsSnapshot};

/// Configuration for one region client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionClientConfig {
    /// Address of the region server, used in errors and logs.
    pub server: String,
    /// Milliseconds between batch flushes. Zero disables batching.
    pub flush_interval_ms: u16,
}

impl Default for RegionClientConfig {
    fn default() -> Self {
        Self {
            server: "localhost:16020".to_string(),
            flush_interval_ms: 1000,
        }
    }
}

impl RegionClientConfig {
    /// Creates a config for `server`.
    pub fn new(server: impl Into<String>, flush_interval_ms: u16) -> Self {
        Self {
            server: server.into(),
            flush_interval_ms,
        }
    }

    /// Returns true when bufferable requests are batched.
    pub fn batching_enabled(&self) -> bool {
        self.flush_interval_ms > 0
    }
}

/// Response for an in-flight request, as decoded by the response path.
#[derive(Debug, Clone)]
pub enum Completion {
    /// Outcome of a single-action frame.
    Single(RpcResult),
    /// Per-element outcomes of a multi-action frame, in submission order.
    Multi(Vec<RpcResult>),
}

struct ConnState {
    channel: Option<Arc<dyn Channel>>,
    dead: bool,
    batch: Option<Batch>,
    pending: VecDeque<Request>,
    in_flight: HashMap<u64, Request>,
}

/// What happened to a request inside the critical section.
enum Admission {
    Written,
    Batched,
    Queued,
    Fail(Request, RpcError),
    Reroute(Request),
    /// The connection died here; these requests still need the dead rule.
    Died(Vec<Request>),
}

/// Dispatch state for one region server connection.
pub struct RegionClient {
    config: RegionClientConfig,
    state: Mutex<ConnState>,
    stats: Arc<ClientStats>,
    reroute: Reroute,
    next_id: AtomicU64,
}

impl RegionClient {
    /// Creates a client that is still connecting: nothing is written until
    /// [`attach_channel`](Self::attach_channel) is called.
    pub fn new(config: RegionClientConfig, stats: Arc<ClientStats>, reroute: Reroute) -> Self {
        Self {
            config,
            state: Mutex::new(ConnState {
                channel: None,
                dead: false,
                batch: None,
                pending: VecDeque::new(),
                in_flight: HashMap::new(),
            }),
            stats,
            reroute,
            next_id: AtomicU64::new(1),
        }
    }

    /// Creates a client over an already established channel.
    pub fn with_channel(
        config: RegionClientConfig,
        stats: Arc<ClientStats>,
        reroute: Reroute,
        channel: Arc<dyn Channel>,
    ) -> Self {
        let client = Self::new(config, stats, reroute);
        client.state.lock().channel = Some(channel);
        client
    }

    /// Configuration this client was built with.
    pub fn config(&self) -> &RegionClientConfig {
        &self.config
    }

    /// Address of the region server.
    pub fn server(&self) -> &str {
        &self.config.server
    }

    /// Snapshot of the counters this client reports into.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns true once the connection has been marked dead.
    pub fn is_dead(&self) -> bool {
        self.state.lock().dead
    }

    /// Returns true while a channel is attached.
    pub fn has_channel(&self) -> bool {
        self.state.lock().channel.is_some()
    }

    /// Number of requests in the current batch.
    pub fn pending_batch_len(&self) -> usize {
        self.state.lock().batch.as_ref().map_or(0, Batch::len)
    }

    /// Number of requests waiting for a channel.
    pub fn pending_connect_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of written requests awaiting a response.
    pub fn inflight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Admits a request.
    ///
    /// Fails synchronously only when a leaf request is dispatched before its
    /// result handle was obtained. Every other outcome is delivered through
    /// the request's handle, or by the owning client after a reroute.
    pub fn dispatch(&self, request: Request) -> Result<()> {
        if !request.has_result_handle() {
            warn!(
                server = %self.config.server,
                kind = request.name(),
                "request dispatched without a result handle"
            );
            return Err(RpcError::UninitializedResult {
                kind: request.name(),
            });
        }
        let admission = {
            let mut state = self.state.lock();
            self.admit_locked(&mut state, request)
        };
        self.settle(admission);
        Ok(())
    }

    fn admit_locked(&self, state: &mut ConnState, request: Request) -> Admission {
        if state.dead {
            return self.route_dead(request);
        }
        let Some(channel) = state.channel.clone() else {
            trace!(server = %self.config.server, kind = request.name(), "queued until connected");
            state.pending.push_back(request);
            self.stats.inc_pending_rpcs();
            return Admission::Queued;
        };
        if request.is_bufferable() && self.config.batching_enabled() {
            state.batch.get_or_insert_with(Batch::new).add(request);
            self.stats.inc_pending_batched();
            return Admission::Batched;
        }
        self.write_locked(state, channel.as_ref(), request)
    }

    fn route_dead(&self, request: Request) -> Admission {
        if request.region().is_some() && !request.fail_fast() {
            Admission::Reroute(request)
        } else {
            Admission::Fail(request, self.connection_reset())
        }
    }

    fn write_locked(&self, state: &mut ConnState, channel: &dyn Channel, request: Request) -> Admission {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let encoded = match request.encode(request_id) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(
                    server = %self.config.server,
                    request_id,
                    kind = request.name(),
                    error = %err,
                    "failed to serialize request"
                );
                return Admission::Fail(request, err);
            }
        };
        if let Err(err) = channel.write(encoded.frame) {
            warn!(server = %self.config.server, request_id, error = %err, "channel rejected write");
            let mut orphans = vec![request];
            orphans.extend(self.take_outstanding_locked(state));
            return Admission::Died(orphans);
        }
        self.stats.inc_rpcs_sent();
        if encoded.multi {
            self.stats.inc_num_multi_rpcs();
        }
        debug!(
            server = %self.config.server,
            request_id,
            kind = request.name(),
            multi = encoded.multi,
            "rpc written"
        );
        state.in_flight.insert(request_id, request);
        self.stats.inc_inflight();
        Admission::Written
    }

    fn settle(&self, admission: Admission) {
        match admission {
            Admission::Written | Admission::Batched | Admission::Queued => {}
            Admission::Fail(request, err) => {
                if err.is_connection_reset() {
                    self.stats.add_connection_resets(request.leaf_count() as u64);
                }
                request.fail(err);
            }
            Admission::Reroute(request) => match self.reroute.send(request) {
                Ok(()) => self.stats.inc_rerouted(),
                Err(request) => {
                    warn!(
                        server = %self.config.server,
                        kind = request.name(),
                        "owner gone, cannot reroute"
                    );
                    self.stats.inc_connection_resets();
                    request.fail(self.connection_reset());
                }
            },
            Admission::Died(orphans) => self.orphan(orphans),
        }
    }

    fn connection_reset(&self) -> RpcError {
        RpcError::ConnectionReset {
            server: self.config.server.clone(),
        }
    }

    /// Makes the connection writable and drains the requests that queued
    /// while it was coming up, in arrival order.
    pub fn attach_channel(&self, channel: Arc<dyn Channel>) -> Result<()> {
        let admissions = {
            let mut state = self.state.lock();
            if state.dead {
                return Err(RpcError::ConnectionDead {
                    server: self.config.server.clone(),
                });
            }
            state.channel = Some(channel);
            let pending = std::mem::take(&mut state.pending);
            self.stats.dec_pending_rpcs(pending.len() as u64);
            let mut admissions = Vec::with_capacity(pending.len());
            for request in pending {
                admissions.push(self.admit_locked(&mut state, request));
            }
            admissions
        };
        debug!(server = %self.config.server, drained = admissions.len(), "channel attached");
        for admission in admissions {
            self.settle(admission);
        }
        Ok(())
    }

    /// Sends the current batch, if any. Returns how many requests it held.
    pub fn flush(&self) -> usize {
        let (flushed, admission) = {
            let mut state = self.state.lock();
            let Some(batch) = state.batch.take() else {
                return 0;
            };
            let flushed = batch.len();
            self.stats.dec_pending_batched(flushed as u64);
            (flushed, self.admit_locked(&mut state, Request::from(batch)))
        };
        trace!(server = %self.config.server, flushed, "batch flushed");
        self.settle(admission);
        flushed
    }

    /// Marks the connection dead and gives up every request it still holds.
    ///
    /// Queued, batched and in-flight requests are rerouted or failed exactly
    /// as a new dispatch to a dead connection would be. Batches are split
    /// into their elements and their own handle fails. Calling this on a
    /// dead connection does nothing.
    pub fn mark_dead(&self) {
        let orphans = {
            let mut state = self.state.lock();
            if state.dead {
                return;
            }
            self.take_outstanding_locked(&mut state)
        };
        self.orphan(orphans);
    }

    /// Flips the connection to dead and empties it. Gauges follow.
    fn take_outstanding_locked(&self, state: &mut ConnState) -> Vec<Request> {
        state.dead = true;
        state.channel = None;

        let mut orphans: Vec<Request> = Vec::new();
        let pending = std::mem::take(&mut state.pending);
        self.stats.dec_pending_rpcs(pending.len() as u64);
        orphans.extend(pending);

        if let Some(batch) = state.batch.take() {
            self.stats.dec_pending_batched(batch.len() as u64);
            orphans.extend(batch.into_requests());
        }

        let mut in_flight: Vec<_> = state.in_flight.drain().collect();
        in_flight.sort_by_key(|(request_id, _)| *request_id);
        self.stats.dec_inflight(in_flight.len() as u64);
        orphans.extend(in_flight.into_iter().map(|(_, request)| request));
        orphans
    }

    /// Routes what a freshly dead connection held, splitting batches.
    fn orphan(&self, orphans: Vec<Request>) {
        self.stats.inc_dead_connections();
        warn!(
            server = %self.config.server,
            outstanding = orphans.len(),
            "connection dead"
        );

        let mut leaves = Vec::with_capacity(orphans.len());
        for request in orphans {
            self.push_leaves(request, &mut leaves);
        }
        for leaf in leaves {
            let admission = self.route_dead(leaf);
            self.settle(admission);
        }
    }

    fn push_leaves(&self, request: Request, out: &mut Vec<Request>) {
        match request.into_batch() {
            Ok(batch) => {
                let _ = batch.result_handle().fail(self.connection_reset());
                for element in batch.into_requests() {
                    self.push_leaves(element, out);
                }
            }
            Err(leaf) => out.push(leaf),
        }
    }

    /// Resolves the in-flight request written under `request_id`.
    pub fn complete(&self, request_id: u64, completion: Completion) -> Result<()> {
        let request = self
            .state
            .lock()
            .in_flight
            .remove(&request_id)
            .ok_or(RpcError::UnknownRequest { request_id })?;
        self.stats.dec_inflight(1);

        match (request.kind(), completion) {
            (RequestKind::Action(_), Completion::Single(outcome)) => request.complete(outcome),
            (RequestKind::Batch(_), Completion::Single(Err(err))) => request.fail(err),
            (RequestKind::Batch(batch), Completion::Single(Ok(payload))) if batch.len() == 1 => {
                // Sent flattened: the response belongs to the only element.
                batch.requests()[0].complete(Ok(payload.clone()));
                request.complete(Ok(payload));
            }
            (RequestKind::Batch(batch), Completion::Multi(outcomes))
                if outcomes.len() == batch.len() =>
            {
                for (element, outcome) in batch.requests().iter().zip(outcomes) {
                    element.complete(outcome);
                }
                request.complete(Ok(Bytes::new()));
            }
            (_, completion) => {
                let err = RpcError::InvalidFrame {
                    reason: format!(
                        "response shape {} does not match {} request {request_id}",
                        completion_shape(&completion),
                        request.name()
                    ),
                };
                request.fail(err.clone());
                return Err(err);
            }
        }
        Ok(())
    }
}

fn completion_shape(completion: &Completion) -> String {
    match completion {
        Completion::Single(_) => "single".to_string(),
        Completion::Multi(outcomes) => format!("multi({})", outcomes.len()),
    }
}

impl std::fmt::Debug for RegionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RegionClient")
            .field("server", &self.config.server)
            .field("dead", &state.dead)
            .field("connected", &state.channel.is_some())
            .field("batched", &state.batch.as_ref().map_or(0, Batch::len))
            .field("pending", &state.pending.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}
