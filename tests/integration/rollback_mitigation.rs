//! Rollback-mitigation integration tests.
//!
//! With mitigation enabled, events reach the listener only once the
//! producer reports them persisted: pausing persistence holds a whole batch
//! back, resuming releases it, and a restart that discards unpersisted
//! writes means the held batch is never delivered at all.
//!
//! Uses the in-process mock DCP server; helpers are duplicated per test
//! file to keep each suite self-contained and independently runnable.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dcp_client::{
    AckHandle, ClientConfig, DatabaseChangeListener, DcpClient, DcpError, MitigationConfig,
    Mutation, StaticCredentials, StreamFrom, StreamTo,
};
use dcp_test_utils::MockDcpServer;

const PARTITIONS: u16 = 64;

#[derive(Default)]
struct Recorder {
    mutations: AtomicU64,
    keys: Mutex<Vec<String>>,
}

impl DatabaseChangeListener for Recorder {
    fn on_mutation(&self, mutation: Mutation, ack: AckHandle) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.keys
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&mutation.key).into_owned());
        ack.ack();
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
    let mut config = ClientConfig::new(
        vec![server.addr()],
        "default",
        Arc::new(StaticCredentials {
            username: "tester".into(),
            password: "secret".into(),
        }),
    );
    config.mitigation = Some(MitigationConfig {
        poll_interval: Duration::from_millis(20),
    });
    config
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
async fn unpersisted_writes_are_withheld_until_persisted() {
    init_logging();
    let server = MockDcpServer::start(PARTITIONS).await.unwrap();

    let recorder = Arc::new(Recorder::default());
    let mut client = DcpClient::open(test_config(&server));
    client.set_listener(recorder.clone());
    client.connect().await.unwrap();

    let all: Vec<u16> = (0..PARTITIONS).collect();
    client
        .stream_partitions(&all, StreamFrom::Beginning, StreamTo::Infinity)
        .unwrap();

    // Batch A, persisted as written: delivered.
    server.write_one_per_vbucket("a");
    let a_done = wait_for(Duration::from_secs(15), || {
        recorder.mutations.load(Ordering::SeqCst) == u64::from(PARTITIONS)
    })
    .await;
    assert!(a_done, "batch A not delivered");

    // Batch B with persistence stopped: withheld.
    server.set_persistence(false);
    server.write_one_per_vbucket("b");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        recorder.mutations.load(Ordering::SeqCst),
        u64::from(PARTITIONS),
        "unpersisted batch must not reach the listener"
    );

    // Resume persistence: batch B drains.
    server.set_persistence(true);
    let b_done = wait_for(Duration::from_secs(15), || {
        recorder.mutations.load(Ordering::SeqCst) == 2 * u64::from(PARTITIONS)
    })
    .await;
    assert!(b_done, "batch B not released after persistence resumed");

    client.disconnect().await;
}

#[tokio::test]
async fn discarded_writes_are_never_delivered_after_restart() {
    init_logging();
    let server = MockDcpServer::start(PARTITIONS).await.unwrap();

    let recorder = Arc::new(Recorder::default());
    let mut client = DcpClient::open(test_config(&server));
    client.set_listener(recorder.clone());
    client.connect().await.unwrap();

    let all: Vec<u16> = (0..PARTITIONS).collect();
    client
        .stream_partitions(&all, StreamFrom::Beginning, StreamTo::Infinity)
        .unwrap();

    server.write_one_per_vbucket("a");
    let a_done = wait_for(Duration::from_secs(15), || {
        recorder.mutations.load(Ordering::SeqCst) == u64::from(PARTITIONS)
    })
    .await;
    assert!(a_done, "batch A not delivered");

    // Batch B is never persisted, and the restart discards it.
    server.set_persistence(false);
    server.write_one_per_vbucket("b");
    tokio::time::sleep(Duration::from_millis(300)).await;
    server.restart(true);
    server.set_persistence(true);

    // Batch C lands after recovery.
    server.write_one_per_vbucket("c");

    let done = wait_for(Duration::from_secs(30), || {
        recorder.mutations.load(Ordering::SeqCst) >= 2 * u64::from(PARTITIONS)
    })
    .await;
    assert!(done, "batch C not delivered after reconnect");
    // Exactly A + C: nothing from B, no duplicates from the replay.
    assert_eq!(
        recorder.mutations.load(Ordering::SeqCst),
        2 * u64::from(PARTITIONS)
    );

    let keys = recorder.keys.lock().unwrap();
    let unique: HashSet<&String> = keys.iter().collect();
    assert_eq!(unique.len(), keys.len(), "duplicate deliveries detected");
    assert!(
        keys.iter().all(|k| !k.starts_with("b-")),
        "a discarded write leaked through: {:?}",
        keys.iter().filter(|k| k.starts_with("b-")).collect::<Vec<_>>()
    );

    client.disconnect().await;
}
