//! Handshake and flow-control integration tests.
//!
//! Asserts the DCP_CONTROL keys arrive in their fixed order, that
//! buffer-acks flow back once the ack watermark is crossed, and that the
//! manual flow-control mode withholds credit until the application acks.
//!
//! Uses the in-process mock DCP server; helpers are duplicated per test
//! file to keep each suite self-contained and independently runnable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dcp_client::{
    AckHandle, ClientConfig, DatabaseChangeListener, DcpClient, DcpError, FlowControlMode,
    Mutation, StaticCredentials, StreamFrom, StreamTo,
};
use dcp_test_utils::MockDcpServer;

#[derive(Default)]
struct Counting {
    mutations: AtomicU64,
}

impl DatabaseChangeListener for Counting {
    fn on_mutation(&self, _mutation: Mutation, ack: AckHandle) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        ack.ack();
    }

    fn on_failure(&self, error: DcpError) {
        eprintln!("listener failure: {error}");
    }
}

/// Stashes ack handles instead of acking, so credit never returns until
/// the test decides to release them.
#[derive(Default)]
struct Hoarding {
    mutations: AtomicU64,
    handles: Mutex<Vec<AckHandle>>,
}

impl DatabaseChangeListener for Hoarding {
    fn on_mutation(&self, _mutation: Mutation, ack: AckHandle) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().unwrap().push(ack);
    }

    // Snapshot markers are charged too; hoard their credit as well so no
    // ack can reach the server until the test releases everything.
    fn on_snapshot(&self, _marker: dcp_client::SnapshotMarker, ack: AckHandle) {
        self.handles.lock().unwrap().push(ack);
    }

    fn on_failure(&self, error: DcpError) {
        eprintln!("listener failure: {error}");
    }
}

fn test_config(server: &MockDcpServer) -> ClientConfig {
    ClientConfig::new(
        vec![server.addr()],
        "default",
        Arc::new(StaticCredentials {
            username: "tester".into(),
            password: "secret".into(),
        }),
    )
}

async fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

#[tokio::test]
async fn control_keys_arrive_in_fixed_order() {
    let server = MockDcpServer::start(8).await.unwrap();

    let mut config = test_config(&server);
    config.control.enable_expiry_opcode = true;
    config.control.send_stream_end_on_client_close_stream = true;

    let mut client = DcpClient::open(config);
    client.set_listener(Arc::new(Counting::default()));
    client.connect().await.unwrap();
    client
        .stream_partitions(&[0], StreamFrom::Beginning, StreamTo::Infinity)
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || !server.control_keys().is_empty()).await,
        "channel never sent DCP_CONTROL"
    );
    let keys = server.control_keys();
    assert_eq!(
        &keys[..5],
        &[
            "connection_buffer_size".to_owned(),
            "enable_noop".to_owned(),
            "set_noop_interval".to_owned(),
            "enable_expiry_opcode".to_owned(),
            "send_stream_end_on_client_close_stream".to_owned(),
        ]
    );

    client.disconnect().await;
}

#[tokio::test]
async fn buffer_acks_flow_once_watermark_is_crossed() {
    let server = MockDcpServer::start(8).await.unwrap();

    let mut config = test_config(&server);
    // Tiny window so a handful of mutations crosses the 50% watermark.
    config.control.connection_buffer_size = 1024;

    let counting = Arc::new(Counting::default());
    let mut client = DcpClient::open(config);
    client.set_listener(counting.clone());
    client.connect().await.unwrap();
    let all: Vec<u16> = (0..8).collect();
    client
        .stream_partitions(&all, StreamFrom::Beginning, StreamTo::Infinity)
        .unwrap();

    for round in 0..20 {
        server.write_one_per_vbucket(&format!("r{round}"));
    }

    assert!(
        wait_for(Duration::from_secs(10), || {
            counting.mutations.load(Ordering::SeqCst) == 160
        })
        .await,
        "not all mutations delivered"
    );
    assert!(
        wait_for(Duration::from_secs(10), || server.acked_bytes() > 0).await,
        "no buffer ack reached the server"
    );

    client.disconnect().await;
}

#[tokio::test]
async fn manual_mode_returns_credit_only_on_explicit_ack() {
    let server = MockDcpServer::start(8).await.unwrap();

    let mut config = test_config(&server);
    config.control.connection_buffer_size = 1024;
    config.flow_control_mode = FlowControlMode::Manual;

    let hoarding = Arc::new(Hoarding::default());
    let mut client = DcpClient::open(config);
    client.set_listener(hoarding.clone());
    client.connect().await.unwrap();
    let all: Vec<u16> = (0..8).collect();
    client
        .stream_partitions(&all, StreamFrom::Beginning, StreamTo::Infinity)
        .unwrap();

    for round in 0..20 {
        server.write_one_per_vbucket(&format!("r{round}"));
    }
    assert!(
        wait_for(Duration::from_secs(10), || {
            hoarding.mutations.load(Ordering::SeqCst) == 160
        })
        .await
    );

    // Withheld handles: no credit can have crossed the watermark.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.acked_bytes(), 0, "credit leaked without an explicit ack");

    // Release everything; the accumulated credit crosses the watermark.
    for handle in hoarding.handles.lock().unwrap().drain(..) {
        handle.ack();
    }
    assert!(
        wait_for(Duration::from_secs(10), || server.acked_bytes() > 0).await,
        "explicit acks never produced a buffer ack"
    );

    client.disconnect().await;
}
