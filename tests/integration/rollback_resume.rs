//! In-band rollback handling: resume at the server's seqno, or veto.
//!
//! A client resuming with a seqno beyond the producer's durable history
//! gets a ROLLBACK response; the default listener behavior rewinds to the
//! suggested seqno and retries, while a veto stops the vbucket and surfaces
//! a fatal failure.
//!
//! Uses the in-process mock DCP server; helpers are duplicated per test
//! file to keep each suite self-contained and independently runnable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dcp_client::{
    AckHandle, ClientConfig, DatabaseChangeListener, DcpClient, DcpError, Mutation,
    PartitionState, RollbackAction, SessionSnapshot, StaticCredentials, StreamFrom, StreamTo,
};
use dcp_test_utils::MockDcpServer;

const PARTITIONS: u16 = 8;

struct RollbackRecorder {
    veto: bool,
    rollbacks: Mutex<Vec<(u16, u64)>>,
    mutations: Mutex<Vec<(u16, u64)>>,
    failures: AtomicU64,
}

impl RollbackRecorder {
    fn new(veto: bool) -> Self {
        RollbackRecorder {
            veto,
            rollbacks: Mutex::new(Vec::new()),
            mutations: Mutex::new(Vec::new()),
            failures: AtomicU64::new(0),
        }
    }
}

impl DatabaseChangeListener for RollbackRecorder {
    fn on_mutation(&self, mutation: Mutation, ack: AckHandle) {
        self.mutations
            .lock()
            .unwrap()
            .push((mutation.vbucket, mutation.by_seqno));
        ack.ack();
    }

    fn on_rollback(&self, vbucket: u16, rollback_seqno: u64) -> RollbackAction {
        self.rollbacks.lock().unwrap().push((vbucket, rollback_seqno));
        if self.veto {
            RollbackAction::Veto
        } else {
            RollbackAction::Resume
        }
    }

    fn on_failure(&self, error: DcpError) {
        eprintln!("listener failure: {error}");
        self.failures.fetch_add(1, Ordering::SeqCst);
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

/// A snapshot claiming vbucket 0 is far ahead of anything the server has.
fn overreaching_snapshot() -> SessionSnapshot {
    let mut partitions = vec![PartitionState::default(); usize::from(PARTITIONS)];
    partitions[0] = PartitionState {
        vbuuid: 0x999,
        seqno: 500,
        snapshot_start: 500,
        snapshot_end: 500,
        failover_log: vec![(0x999, 0)],
        collections_manifest_uid: 0,
    };
    SessionSnapshot { partitions }
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
async fn default_rollback_resumes_from_suggested_seqno() {
    let server = MockDcpServer::start(PARTITIONS).await.unwrap();
    for i in 0..3 {
        server.write(0, &format!("pre-{i}"), b"{}");
    }

    let recorder = Arc::new(RollbackRecorder::new(false));
    let mut client = DcpClient::open(test_config(&server));
    client.set_listener(recorder.clone());
    client.connect().await.unwrap();
    client.restore_session_state(&overreaching_snapshot()).unwrap();
    client
        .stream_partitions(&[0], StreamFrom::Beginning, StreamTo::Infinity)
        .unwrap();

    // The rollback lands first, then the retried stream goes live.
    assert!(
        wait_for(Duration::from_secs(10), || {
            !recorder.rollbacks.lock().unwrap().is_empty()
        })
        .await,
        "no rollback observed"
    );
    assert_eq!(recorder.rollbacks.lock().unwrap()[0], (0, 3));

    // Only writes after the rewound checkpoint are delivered.
    server.write(0, "post", b"{}");
    assert!(
        wait_for(Duration::from_secs(10), || {
            !recorder.mutations.lock().unwrap().is_empty()
        })
        .await,
        "no mutation after rollback retry"
    );
    let mutations = recorder.mutations.lock().unwrap();
    assert_eq!(*mutations, vec![(0, 4)]);
    assert_eq!(recorder.failures.load(Ordering::SeqCst), 0);

    drop(mutations);
    client.disconnect().await;
}

#[tokio::test]
async fn vetoed_rollback_stops_the_vbucket_with_a_fatal_failure() {
    let server = MockDcpServer::start(PARTITIONS).await.unwrap();

    let recorder = Arc::new(RollbackRecorder::new(true));
    let mut client = DcpClient::open(test_config(&server));
    client.set_listener(recorder.clone());
    client.connect().await.unwrap();
    client.restore_session_state(&overreaching_snapshot()).unwrap();
    client
        .stream_partitions(&[0], StreamFrom::Beginning, StreamTo::Infinity)
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || {
            recorder.failures.load(Ordering::SeqCst) > 0
        })
        .await,
        "veto should surface on_failure"
    );
    // The vbucket stays stopped: nothing is delivered even as writes land.
    server.write(0, "post", b"{}");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(recorder.mutations.lock().unwrap().is_empty());

    client.disconnect().await;
}
