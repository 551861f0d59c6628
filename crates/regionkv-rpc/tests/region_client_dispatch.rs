//! Admission behavior of `RegionClient::dispatch` across connection states.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use regionkv_rpc::{
    Batch, Channel, ClientStats, RegionClient, RegionClientConfig, RegionRef, Request, Reroute,
    ResultHandle, RpcError,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct CountingChannel {
    writes: AtomicUsize,
}

impl Channel for CountingChannel {
    fn write(&self, _frame: Bytes) -> regionkv_rpc::Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn peer_addr(&self) -> &str {
        "rs1.example:16020"
    }
}

enum ConnState {
    Connected,
    Connecting,
    Dead,
}

struct Harness {
    client: RegionClient,
    channel: Arc<CountingChannel>,
    reroutes: UnboundedReceiver<Request>,
}

impl Harness {
    fn new(state: ConnState) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let channel = Arc::new(CountingChannel::default());
        let (reroute, reroutes) = Reroute::channel();
        let config = RegionClientConfig::new("rs1.example:16020", 1000);
        let stats = Arc::new(ClientStats::new());
        let client = match state {
            ConnState::Connected => {
                RegionClient::with_channel(config, stats, reroute, channel.clone())
            }
            ConnState::Connecting => RegionClient::new(config, stats, reroute),
            ConnState::Dead => {
                let client = RegionClient::new(config, stats, reroute);
                client.mark_dead();
                client
            }
        };
        Self {
            client,
            channel,
            reroutes,
        }
    }

    fn writes(&self) -> usize {
        self.channel.writes.load(Ordering::Relaxed)
    }

    fn rerouted(&mut self) -> Vec<Request> {
        let mut rerouted = Vec::new();
        while let Ok(request) = self.reroutes.try_recv() {
            rerouted.push(request);
        }
        rerouted
    }
}

fn region() -> RegionRef {
    RegionRef::new("table", "table,,1700000000000.abc.")
}

fn put() -> Request {
    Request::put("key", "family", "QAL", vec![42u8])
}

async fn assert_unresolved(handle: &ResultHandle) {
    let outcome = handle.join(Duration::from_millis(1)).await;
    assert!(matches!(outcome, Err(RpcError::Timeout { .. })), "got {outcome:?}");
}

#[tokio::test]
async fn test_put_is_batched() {
    let mut h = Harness::new(ConnState::Connected);
    let mut put = put();
    let handle = put.result_handle();

    h.client.dispatch(put).unwrap();

    assert_unresolved(&handle).await;
    assert_eq!(h.client.pending_batch_len(), 1);
    assert_eq!(h.writes(), 0);
    assert!(h.rerouted().is_empty());
    let stats = h.client.stats();
    assert_eq!(stats.rpcs_sent, 0);
    assert_eq!(stats.pending_batched_rpcs, 1);
    assert_eq!(stats.pending_rpcs, 0);
}

#[tokio::test]
async fn test_append_is_batched() {
    let mut h = Harness::new(ConnState::Connected);
    let mut append = Request::append("key", "family", "QAL", vec![42u8]);
    let handle = append.result_handle();

    h.client.dispatch(append).unwrap();

    assert_unresolved(&handle).await;
    assert_eq!(h.client.pending_batch_len(), 1);
    assert_eq!(h.writes(), 0);
    assert!(h.rerouted().is_empty());
    let stats = h.client.stats();
    assert_eq!(stats.rpcs_sent, 0);
    assert_eq!(stats.pending_batched_rpcs, 1);
    assert_eq!(stats.pending_rpcs, 0);
}

#[tokio::test]
async fn test_get_is_written() {
    let mut h = Harness::new(ConnState::Connected);
    let mut get = Request::get("key", "family", Some(Bytes::from_static(b"QAL"))).with_region(region());
    let _handle = get.result_handle();

    h.client.dispatch(get).unwrap();

    assert_eq!(h.writes(), 1);
    assert!(h.rerouted().is_empty());
    let stats = h.client.stats();
    assert_eq!(stats.rpcs_sent, 1);
    assert_eq!(stats.pending_batched_rpcs, 0);
    assert_eq!(stats.pending_rpcs, 0);
}

#[test]
fn test_get_without_result_handle_rejected() {
    for state in [ConnState::Connected, ConnState::Connecting, ConnState::Dead] {
        let mut h = Harness::new(state);
        let get = Request::get("key", "family", None);

        let err = h.client.dispatch(get).unwrap_err();

        assert_eq!(err, RpcError::UninitializedResult { kind: "get" });
        assert_eq!(h.writes(), 0);
        assert!(h.rerouted().is_empty());
        assert_eq!(h.client.stats().pending_rpcs, 0);
    }
}

#[tokio::test]
async fn test_multi_action_written_once() {
    let mut h = Harness::new(ConnState::Connected);
    let mut batch = Batch::new();
    batch.add(put().with_region(region()));
    batch.add(put().with_region(region()));
    let handle = batch.result_handle();

    h.client.dispatch(Request::from(batch)).unwrap();

    assert_unresolved(&handle).await;
    assert_eq!(h.writes(), 1);
    assert!(h.rerouted().is_empty());
    let stats = h.client.stats();
    assert_eq!(stats.rpcs_sent, 1);
    assert_eq!(stats.pending_batched_rpcs, 0);
    assert_eq!(stats.pending_rpcs, 0);
    assert_eq!(stats.num_multi_rpcs, 1);
}

#[tokio::test]
async fn test_multi_action_of_one_sent_as_single() {
    let mut h = Harness::new(ConnState::Connected);
    let mut batch = Batch::new();
    batch.add(put().with_region(region()));
    let handle = batch.result_handle();

    h.client.dispatch(Request::from(batch)).unwrap();

    assert_unresolved(&handle).await;
    assert_eq!(h.writes(), 1);
    assert!(h.rerouted().is_empty());
    let stats = h.client.stats();
    assert_eq!(stats.rpcs_sent, 1);
    assert_eq!(stats.pending_batched_rpcs, 0);
    assert_eq!(stats.pending_rpcs, 0);
    assert_eq!(stats.num_multi_rpcs, 0);
}

#[tokio::test]
async fn test_empty_multi_action_fails() {
    let mut h = Harness::new(ConnState::Connected);
    let batch = Batch::new();
    let handle = batch.result_handle();

    h.client.dispatch(Request::from(batch)).unwrap();

    let outcome = handle.join(Duration::from_millis(1)).await;
    assert_eq!(outcome, Err(RpcError::MissingPayload));
    assert_eq!(h.writes(), 0);
    assert!(h.rerouted().is_empty());
    let stats = h.client.stats();
    assert_eq!(stats.rpcs_sent, 0);
    assert_eq!(stats.pending_batched_rpcs, 0);
    assert_eq!(stats.pending_rpcs, 0);
    assert_eq!(stats.num_multi_rpcs, 0);
    assert_eq!(h.client.inflight_len(), 0);
}

#[tokio::test]
async fn test_put_waits_for_channel() {
    let mut h = Harness::new(ConnState::Connecting);
    let mut put = put();
    let handle = put.result_handle();

    h.client.dispatch(put).unwrap();

    assert_unresolved(&handle).await;
    assert_eq!(h.writes(), 0);
    assert!(h.rerouted().is_empty());
    assert_eq!(h.client.pending_connect_len(), 1);
    let stats = h.client.stats();
    assert_eq!(stats.rpcs_sent, 0);
    assert_eq!(stats.pending_batched_rpcs, 0);
    assert_eq!(stats.pending_rpcs, 1);
}

#[tokio::test]
async fn test_dead_connection_reroutes_put() {
    let mut h = Harness::new(ConnState::Dead);
    let mut put = put().with_region(region());
    let handle = put.result_handle();

    h.client.dispatch(put).unwrap();

    assert_unresolved(&handle).await;
    assert_eq!(h.writes(), 0);
    let rerouted = h.rerouted();
    assert_eq!(rerouted.len(), 1);
    let mut rerouted = rerouted.into_iter().next().unwrap();
    assert!(rerouted.result_handle().same_as(&handle));
    let stats = h.client.stats();
    assert_eq!(stats.rpcs_sent, 0);
    assert_eq!(stats.pending_batched_rpcs, 0);
    assert_eq!(stats.pending_rpcs, 0);
    assert_eq!(stats.rpcs_rerouted, 1);
}

#[tokio::test]
async fn test_dead_connection_without_region_resets() {
    let mut h = Harness::new(ConnState::Dead);
    let mut put = put();
    let handle = put.result_handle();

    h.client.dispatch(put).unwrap();

    let outcome = handle.join(Duration::from_millis(1)).await;
    assert!(outcome.unwrap_err().is_connection_reset());
    assert_eq!(h.writes(), 0);
    assert!(h.rerouted().is_empty());
    let stats = h.client.stats();
    assert_eq!(stats.rpcs_sent, 0);
    assert_eq!(stats.pending_batched_rpcs, 0);
    assert_eq!(stats.pending_rpcs, 0);
}

#[tokio::test]
async fn test_dead_connection_fail_fast_resets() {
    let mut h = Harness::new(ConnState::Dead);
    let mut put = put().with_region(region());
    put.set_fail_fast(true);
    let handle = put.result_handle();

    h.client.dispatch(put).unwrap();

    let outcome = handle.join(Duration::from_millis(1)).await;
    assert_eq!(
        outcome,
        Err(RpcError::ConnectionReset {
            server: "rs1.example:16020".to_string()
        })
    );
    assert_eq!(h.writes(), 0);
    assert!(h.rerouted().is_empty());
    let stats = h.client.stats();
    assert_eq!(stats.rpcs_sent, 0);
    assert_eq!(stats.pending_batched_rpcs, 0);
    assert_eq!(stats.pending_rpcs, 0);
    assert_eq!(stats.connection_resets, 1);
}

#[tokio::test]
async fn test_concurrent_dispatch_batches_everything() {
    let h = Harness::new(ConnState::Connected);
    let client = Arc::new(h.client);
    let mut tasks = Vec::new();
    for task in 0..8 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            for i in 0..50 {
                let mut request = Request::put(format!("row-{task}-{i}"), "f", "q", "v");
                let _ = request.result_handle();
                client.dispatch(request).unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(client.pending_batch_len(), 400);
    assert_eq!(client.stats().pending_batched_rpcs, 400);

    assert_eq!(client.flush(), 400);
    assert_eq!(h.channel.writes.load(Ordering::Relaxed), 1);
    let stats = client.stats();
    assert_eq!(stats.rpcs_sent, 1);
    assert_eq!(stats.num_multi_rpcs, 1);
    assert_eq!(stats.pending_batched_rpcs, 0);
}
