//! Full-drain integration test: BEGINNING -> NOW over every partition.
//!
//! Seeds the mock producer with a fixed dataset, streams all 1024 vbuckets
//! from zero to the captured high seqno, and expects every document exactly
//! once followed by STREAM_END(OK) on every stream.
//!
//! Uses the in-process mock DCP server; helpers are duplicated per test
//! file to keep each suite self-contained and independently runnable.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dcp_client::{
    AckHandle, ClientConfig, DatabaseChangeListener, DcpClient, DcpError, Deletion,
    Expiration, Mutation, StaticCredentials, StreamEndReason, StreamFrom, StreamTo,
};
use dcp_test_utils::MockDcpServer;

const PARTITIONS: u16 = 1024;
const DOCS: usize = 7303;

#[derive(Default)]
struct Counts {
    mutations: AtomicU64,
    deletions: AtomicU64,
    expirations: AtomicU64,
    ends_ok: AtomicU64,
}

impl DatabaseChangeListener for Counts {
    fn on_mutation(&self, _mutation: Mutation, ack: AckHandle) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        ack.ack();
    }

    fn on_deletion(&self, _deletion: Deletion, ack: AckHandle) {
        self.deletions.fetch_add(1, Ordering::SeqCst);
        ack.ack();
    }

    fn on_expiration(&self, _expiration: Expiration, ack: AckHandle) {
        self.expirations.fetch_add(1, Ordering::SeqCst);
        ack.ack();
    }

    fn on_stream_end(&self, _vbucket: u16, reason: StreamEndReason) {
        if reason == StreamEndReason::Ok {
            self.ends_ok.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_failure(&self, error: DcpError) {
        eprintln!("listener failure: {error}");
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
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
async fn drains_seeded_dataset_and_ends_every_stream() {
    init_logging();
    let server = MockDcpServer::start(PARTITIONS).await.unwrap();
    server.write_docs(DOCS, "doc");

    let counts = Arc::new(Counts::default());
    let mut client = DcpClient::open(test_config(&server));
    client.set_listener(counts.clone());
    client.connect().await.unwrap();
    assert_eq!(client.num_partitions().unwrap(), PARTITIONS);

    let all: Vec<u16> = (0..PARTITIONS).collect();
    client
        .stream_partitions(&all, StreamFrom::Beginning, StreamTo::Now)
        .unwrap();

    let done = wait_for(Duration::from_secs(60), || {
        counts.ends_ok.load(Ordering::SeqCst) == u64::from(PARTITIONS)
    })
    .await;
    assert!(
        done,
        "only {} of {PARTITIONS} streams ended OK",
        counts.ends_ok.load(Ordering::SeqCst)
    );

    assert_eq!(counts.mutations.load(Ordering::SeqCst), DOCS as u64);
    assert_eq!(counts.deletions.load(Ordering::SeqCst), 0);
    assert_eq!(counts.expirations.load(Ordering::SeqCst), 0);

    client.disconnect().await;
}

#[tokio::test]
async fn empty_bucket_ends_immediately() {
    let server = MockDcpServer::start(16).await.unwrap();

    let counts = Arc::new(Counts::default());
    let mut client = DcpClient::open(test_config(&server));
    client.set_listener(counts.clone());
    client.connect().await.unwrap();

    let all: Vec<u16> = (0..16).collect();
    client
        .stream_partitions(&all, StreamFrom::Beginning, StreamTo::Now)
        .unwrap();

    let done = wait_for(Duration::from_secs(10), || {
        counts.ends_ok.load(Ordering::SeqCst) == 16
    })
    .await;
    assert!(done, "streams on an empty bucket should end OK at once");
    assert_eq!(counts.mutations.load(Ordering::SeqCst), 0);

    client.disconnect().await;
}
