//! Live-tail integration test: NOW -> INFINITY.
//!
//! Opens on an empty bucket, writes one document per vbucket, and expects
//! exactly that many mutations with every stream still open afterwards.
//!
//! Uses the in-process mock DCP server; helpers are duplicated per test
//! file to keep each suite self-contained and independently runnable.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dcp_client::{
    AckHandle, ClientConfig, DatabaseChangeListener, DcpClient, DcpError, FailoverLogEntry,
    Mutation, StaticCredentials, StreamEndReason, StreamFrom, StreamTo,
};
use dcp_test_utils::MockDcpServer;

const PARTITIONS: u16 = 1024;

#[derive(Default)]
struct Counts {
    mutations: AtomicU64,
    opens: AtomicU64,
    ends: AtomicU64,
}

impl DatabaseChangeListener for Counts {
    fn on_mutation(&self, _mutation: Mutation, ack: AckHandle) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        ack.ack();
    }

    fn on_failover_log(&self, _vbucket: u16, _log: &[FailoverLogEntry]) {
        self.opens.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stream_end(&self, _vbucket: u16, _reason: StreamEndReason) {
        self.ends.fetch_add(1, Ordering::SeqCst);
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
async fn observes_only_writes_after_open_and_stays_open() {
    let server = MockDcpServer::start(PARTITIONS).await.unwrap();

    let counts = Arc::new(Counts::default());
    let mut client = DcpClient::open(test_config(&server));
    client.set_listener(counts.clone());
    client.connect().await.unwrap();

    let all: Vec<u16> = (0..PARTITIONS).collect();
    client
        .stream_partitions(&all, StreamFrom::Now, StreamTo::Infinity)
        .unwrap();

    // Every stream must be live before the writes land.
    let opened = wait_for(Duration::from_secs(30), || {
        counts.opens.load(Ordering::SeqCst) == u64::from(PARTITIONS)
    })
    .await;
    assert!(
        opened,
        "only {} of {PARTITIONS} streams opened",
        counts.opens.load(Ordering::SeqCst)
    );

    server.write_one_per_vbucket("live");

    let delivered = wait_for(Duration::from_secs(30), || {
        counts.mutations.load(Ordering::SeqCst) == u64::from(PARTITIONS)
    })
    .await;
    assert!(
        delivered,
        "saw {} mutations",
        counts.mutations.load(Ordering::SeqCst)
    );

    // Infinity streams never end on their own.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(counts.mutations.load(Ordering::SeqCst), u64::from(PARTITIONS));
    assert_eq!(counts.ends.load(Ordering::SeqCst), 0);

    client.disconnect().await;
}
