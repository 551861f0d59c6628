//! The write side of a region server connection.
//!
//! A [`Channel`] accepts complete frames and queues them for transmission;
//! callers never wait for the bytes to reach the socket. [`FramedChannel`] is
//! the tokio implementation: frames go through an unbounded queue to a writer
//! task that owns the underlying stream.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, RpcError};

/// Fire-and-forget frame sink owned by one region client.
pub trait Channel: Send + Sync {
    /// Queues a frame. Fails only if the channel can no longer accept writes.
    fn write(&self, frame: Bytes) -> Result<()>;

    /// Address of the remote server.
    fn peer_addr(&self) -> &str;
}

/// Channel backed by a tokio writer task.
#[derive(Debug)]
pub struct FramedChannel {
    peer: String,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl FramedChannel {
    /// Spawns the writer task for `writer` and returns the channel feeding it.
    ///
    /// The task ends with `Ok(())` once every `FramedChannel` handle is
    /// dropped, or with [`RpcError::ChannelClosed`] on the first I/O error.
    pub fn spawn<W>(peer: impl Into<String>, writer: W) -> (Self, JoinHandle<Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let peer = peer.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let task_peer = peer.clone();
        let handle = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(frame) = rx.recv().await {
                if let Err(e) = writer.write_all(&frame).await {
                    warn!(peer = %task_peer, error = %e, "frame write failed, closing channel");
                    return Err(RpcError::ChannelClosed);
                }
                if let Err(e) = writer.flush().await {
                    warn!(peer = %task_peer, error = %e, "flush failed, closing channel");
                    return Err(RpcError::ChannelClosed);
                }
            }
            debug!(peer = %task_peer, "channel writer finished");
            Ok(())
        });
        (Self { peer, tx }, handle)
    }
}

impl Channel for FramedChannel {
    fn write(&self, frame: Bytes) -> Result<()> {
        self.tx.send(frame).map_err(|_| RpcError::ChannelClosed)
    }

    fn peer_addr(&self) -> &str {
        &self.peer
    }
}
