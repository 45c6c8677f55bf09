//! Reconnect/resume integration tests.
//!
//! After a producer restart the client reconnects with its retained session
//! state and must observe the remaining history exactly once: no gaps, no
//! duplicates, with per-vbucket seqnos strictly increasing across the
//! reconnect boundary.
//!
//! Uses the in-process mock DCP server; helpers are duplicated per test
//! file to keep each suite self-contained and independently runnable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dcp_client::{
    AckHandle, ClientConfig, DatabaseChangeListener, DcpClient, DcpError, Mutation,
    StaticCredentials, StreamFrom, StreamTo,
};
use dcp_test_utils::MockDcpServer;

const PARTITIONS: u16 = 64;

#[derive(Default)]
struct SeqnoTracker {
    mutations: AtomicU64,
    by_vbucket: Mutex<HashMap<u16, Vec<u64>>>,
}

impl DatabaseChangeListener for SeqnoTracker {
    fn on_mutation(&self, mutation: Mutation, ack: AckHandle) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.by_vbucket
            .lock()
            .unwrap()
            .entry(mutation.vbucket)
            .or_default()
            .push(mutation.by_seqno);
        ack.ack();
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
async fn no_gaps_or_duplicates_across_server_restart() {
    let server = MockDcpServer::start(PARTITIONS).await.unwrap();

    let tracker = Arc::new(SeqnoTracker::default());
    let mut client = DcpClient::open(test_config(&server));
    client.set_listener(tracker.clone());
    client.connect().await.unwrap();

    let all: Vec<u16> = (0..PARTITIONS).collect();
    client
        .stream_partitions(&all, StreamFrom::Beginning, StreamTo::Infinity)
        .unwrap();

    server.write_one_per_vbucket("a");
    let a_done = wait_for(Duration::from_secs(15), || {
        tracker.mutations.load(Ordering::SeqCst) == u64::from(PARTITIONS)
    })
    .await;
    assert!(a_done, "batch A not delivered");

    // Restart keeps all persisted data but drops every connection.
    server.restart(false);
    server.write_one_per_vbucket("b");

    let b_done = wait_for(Duration::from_secs(30), || {
        tracker.mutations.load(Ordering::SeqCst) >= 2 * u64::from(PARTITIONS)
    })
    .await;
    assert!(b_done, "batch B not delivered after reconnect");
    assert_eq!(
        tracker.mutations.load(Ordering::SeqCst),
        2 * u64::from(PARTITIONS),
        "replay produced duplicates"
    );

    // Strictly increasing per vbucket means no duplicate and no gap: both
    // batches wrote exactly seqnos 1 and 2 everywhere.
    let by_vbucket = tracker.by_vbucket.lock().unwrap();
    assert_eq!(by_vbucket.len(), usize::from(PARTITIONS));
    for (vbucket, seqnos) in by_vbucket.iter() {
        assert_eq!(seqnos, &vec![1, 2], "vbucket {vbucket} saw {seqnos:?}");
    }

    // The retained session state is a valid checkpoint everywhere.
    let snapshot = client.session_state().unwrap();
    for state in &snapshot.partitions {
        assert!(state.snapshot_start <= state.seqno);
        assert!(state.seqno <= state.snapshot_end);
        assert!(!state.failover_log.is_empty());
    }

    client.disconnect().await;
}

#[tokio::test]
async fn session_snapshot_restores_into_a_new_client() {
    let server = MockDcpServer::start(8).await.unwrap();

    let tracker = Arc::new(SeqnoTracker::default());
    let mut client = DcpClient::open(test_config(&server));
    client.set_listener(tracker.clone());
    client.connect().await.unwrap();
    let all: Vec<u16> = (0..8).collect();
    client
        .stream_partitions(&all, StreamFrom::Beginning, StreamTo::Infinity)
        .unwrap();

    server.write_one_per_vbucket("a");
    assert!(
        wait_for(Duration::from_secs(10), || {
            tracker.mutations.load(Ordering::SeqCst) == 8
        })
        .await
    );

    // Round-trip the snapshot through its serialized form, as a host
    // embedding the client would persist it.
    let snapshot = client.session_state().unwrap();
    let json = serde_json::to_string(&snapshot).unwrap();
    client.disconnect().await;

    server.write_one_per_vbucket("b");

    let restored = serde_json::from_str(&json).unwrap();
    let fresh_tracker = Arc::new(SeqnoTracker::default());
    let mut fresh = DcpClient::open(test_config(&server));
    fresh.set_listener(fresh_tracker.clone());
    fresh.connect().await.unwrap();
    fresh.restore_session_state(&restored).unwrap();
    fresh
        .stream_partitions(&all, StreamFrom::Beginning, StreamTo::Infinity)
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || {
            fresh_tracker.mutations.load(Ordering::SeqCst) == 8
        })
        .await,
        "restored client should only see batch B"
    );
    // Only seqno 2 per vbucket: batch A is behind the restored checkpoint.
    let by_vbucket = fresh_tracker.by_vbucket.lock().unwrap();
    for (vbucket, seqnos) in by_vbucket.iter() {
        assert_eq!(seqnos, &vec![2], "vbucket {vbucket} saw {seqnos:?}");
    }

    fresh.disconnect().await;
}
