#![warn(missing_docs)]

//! regionkv client RPC layer: per-connection request admission, batching and rerouting
//!
//! A [`RegionClient`] owns the channel to one region server and decides for
//! every request whether it is written, batched, queued until the channel is
//! up, or failed and handed back to the owning client for rerouting.

pub mod batch;
pub mod channel;
pub mod error;
pub mod protocol;
pub mod region_client;
pub mod request;
pub mod reroute;
pub mod result;
pub mod stats;

pub use batch::Batch;
pub use channel::{Channel, FramedChannel};
pub use error::{Result, RpcError};
pub use protocol::{Action, RegionRef};
pub use region_client::{Completion, RegionClient, RegionClientConfig};
pub use request::{EncodedRpc, Request, RequestKind};
pub use reroute::Reroute;
pub use result::{ResultHandle, RpcResult};
pub use stats::{ClientStats, StatsSnapshot};
