//! Per-vbucket session state and the resume logic built on it.
//!
//! The store is the only structure shared between the conductor (reader,
//! builds stream requests) and the streams (writers, one per vbucket while
//! open).  State survives reconnects; it is cleared only by explicit caller
//! request or a rollback to zero.
//!
//! # Invariants
//! - `snapshot_start <= seqno <= snapshot_end` at every stable checkpoint.
//! - The failover log is never empty once a stream has succeeded.
//! - `vbuuid` changes only when a failover-log entry is applied.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;

use dcp_protocol::{FailoverLogEntry, StreamRequestParams};

/// Server convention caps the failover log at 25 entries.
const FAILOVER_LOG_CAP: usize = 25;

// ---------------------------------------------------------------------------
// Per-vbucket state
// ---------------------------------------------------------------------------

/// Snapshot of one vbucket's stream position.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionState {
    pub vbuuid: u64,
    pub seqno: u64,
    pub snapshot_start: u64,
    pub snapshot_end: u64,
    /// Newest first, capped at 25 entries.
    pub failover_log: Vec<(u64, u64)>,
    pub collections_manifest_uid: u64,
}

impl PartitionState {
    /// The stream-request tuple for resuming this vbucket.
    pub fn stream_request(&self, end_seqno: u64) -> StreamRequestParams {
        StreamRequestParams {
            vbuuid: self.vbuuid,
            start_seqno: self.seqno,
            end_seqno,
            snapshot_start: self.snapshot_start,
            snapshot_end: self.snapshot_end,
        }
    }

    /// Replace the failover log from a stream-open response and adopt the
    /// newest entry's uuid.
    pub fn apply_failover_log(&mut self, entries: &[FailoverLogEntry]) {
        self.failover_log = entries
            .iter()
            .take(FAILOVER_LOG_CAP)
            .map(|e| (e.vbuuid, e.seqno))
            .collect();
        if let Some(&(vbuuid, _)) = self.failover_log.first() {
            self.vbuuid = vbuuid;
        }
    }

    /// Apply a server rollback to `rollback_seqno`.
    ///
    /// Picks the newest failover entry whose seqno is `<= rollback_seqno`
    /// and adopts its uuid; with no matching entry the vbucket rolls back
    /// to zero (state cleared, log emptied).
    pub fn apply_rollback(&mut self, rollback_seqno: u64) {
        if rollback_seqno == 0 {
            *self = PartitionState::default();
            return;
        }
        match self
            .failover_log
            .iter()
            .find(|(_, seqno)| *seqno <= rollback_seqno)
        {
            Some(&(vbuuid, _)) => {
                self.vbuuid = vbuuid;
                self.seqno = rollback_seqno;
                self.snapshot_start = rollback_seqno;
                self.snapshot_end = rollback_seqno;
            }
            None => {
                *self = PartitionState::default();
            }
        }
    }

    /// Record an observed offset (mutation, deletion, system event, or
    /// seqno-advance).
    pub fn advance(&mut self, by_seqno: u64) {
        debug_assert!(by_seqno >= self.seqno, "seqno moved backwards");
        self.seqno = by_seqno;
    }

    pub fn set_snapshot(&mut self, start: u64, end: u64) {
        self.snapshot_start = start;
        self.snapshot_end = end;
    }

    /// Whether `by_seqno` falls inside the current snapshot window.
    pub fn in_snapshot(&self, by_seqno: u64) -> bool {
        self.snapshot_start <= by_seqno && by_seqno <= self.snapshot_end
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// All partition states for one bucket, indexed by vbucket id.
///
/// Locking is per vbucket; a stream is the sole writer for its vbucket while
/// open, so contention is reader-vs-writer only.
pub struct SessionStore {
    partitions: Vec<RwLock<PartitionState>>,
}

/// Serializable image of a [`SessionStore`], exposed to the host for
/// external persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub partitions: Vec<PartitionState>,
}

impl SessionStore {
    pub fn new(num_partitions: u16) -> Self {
        SessionStore {
            partitions: (0..num_partitions)
                .map(|_| RwLock::new(PartitionState::default()))
                .collect(),
        }
    }

    pub fn num_partitions(&self) -> u16 {
        self.partitions.len() as u16
    }

    /// Read a consistent copy of one vbucket's state.
    pub fn get(&self, vbucket: u16) -> PartitionState {
        self.partitions[vbucket as usize]
            .read()
            .expect("session lock poisoned")
            .clone()
    }

    /// Mutate one vbucket's state under its write lock.
    pub fn update<R>(&self, vbucket: u16, f: impl FnOnce(&mut PartitionState) -> R) -> R {
        let mut state = self.partitions[vbucket as usize]
            .write()
            .expect("session lock poisoned");
        f(&mut state)
    }

    /// Reset one vbucket to the initial state.
    pub fn clear(&self, vbucket: u16) {
        self.update(vbucket, |state| *state = PartitionState::default());
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            partitions: self.partitions.iter().map(|p| {
                p.read().expect("session lock poisoned").clone()
            }).collect(),
        }
    }

    /// Restore from a host-held snapshot.  Partition counts must match; a
    /// bucket's partition count is immutable for its lifetime.
    pub fn restore(&self, snapshot: &SessionSnapshot) -> Result<(), crate::error::DcpError> {
        if snapshot.partitions.len() != self.partitions.len() {
            return Err(crate::error::DcpError::Fatal(format!(
                "snapshot has {} partitions, bucket has {}",
                snapshot.partitions.len(),
                self.partitions.len()
            )));
        }
        for (lock, restored) in self.partitions.iter().zip(&snapshot.partitions) {
            *lock.write().expect("session lock poisoned") = restored.clone();
        }
        Ok(())
    }
}
