//! Handoff of requests from a dead connection back to the owning client.

use tokio::sync::mpsc;

use crate::request::Request;

/// Sending half of the reroute queue.
///
/// The owning client drains the receiver, resolves a new connection for each
/// request and dispatches it there. Sending never blocks and never re-enters
/// the connection that gave the request up.
#[derive(Debug, Clone)]
pub struct Reroute {
    tx: mpsc::UnboundedSender<Request>,
}

impl Reroute {
    /// Creates a reroute queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Request>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Hands `request` to the owner. Returns it back if the owner is gone.
    pub fn send(&self, request: Request) -> std::result::Result<(), Request> {
        self.tx.send(request).map_err(|e| e.0)
    }

    /// Returns true once the receiving side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
