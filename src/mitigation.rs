//! Rollback mitigation: hold events until they are persisted.
//!
//! With mitigation on, the channel routes every data event into a
//! per-vbucket FIFO instead of the listener.  An OBSERVE_SEQNO poller
//! refreshes the active copy's persisted seqno; the buffer releases entries
//! the cursor covers, in arrival order.  Streams (and the poller) only ever
//! target a vbucket's active node, so the active copy's cursor is the
//! persistence authority here.  On channel drop or topology change the
//! buffer is cleared *without* delivery -- recovery restarts from session
//! state, which only ever reflects offsets of released events, so an
//! unreleased event can never have been observed by the host.

use std::collections::{HashMap, VecDeque};
use tracing::debug;

// ---------------------------------------------------------------------------
// Persisted-seqno tracking
// ---------------------------------------------------------------------------

/// Latest persisted seqno per vbucket, as reported by the active copy over
/// this channel's connection.
#[derive(Debug, Default)]
pub struct PersistedSeqnos {
    cursors: HashMap<u16, u64>,
}

impl PersistedSeqnos {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, vbucket: u16, persisted_seqno: u64) {
        let cursor = self.cursors.entry(vbucket).or_insert(0);
        // Reports never move a cursor backwards.
        if persisted_seqno > *cursor {
            *cursor = persisted_seqno;
        }
    }

    /// The cursor for `vbucket`, or None before the first report.
    pub fn get(&self, vbucket: u16) -> Option<u64> {
        self.cursors.get(&vbucket).copied()
    }
}

// ---------------------------------------------------------------------------
// Release buffer
// ---------------------------------------------------------------------------

/// Per-vbucket FIFO of withheld events, generic over the payload the
/// channel enqueues.
#[derive(Debug)]
pub struct MitigationBuffer<T> {
    queues: HashMap<u16, VecDeque<(u64, T)>>,
}

impl<T> Default for MitigationBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MitigationBuffer<T> {
    pub fn new() -> Self {
        MitigationBuffer {
            queues: HashMap::new(),
        }
    }

    pub fn push(&mut self, vbucket: u16, by_seqno: u64, payload: T) {
        self.queues
            .entry(vbucket)
            .or_default()
            .push_back((by_seqno, payload));
    }

    pub fn buffered(&self, vbucket: u16) -> usize {
        self.queues.get(&vbucket).map_or(0, VecDeque::len)
    }

    /// Release every buffered event for `vbucket` whose seqno is covered by
    /// the persisted cursor, preserving arrival order.
    ///
    /// Release invariant: each returned event satisfies
    /// `by_seqno <= persisted` at the moment of release.
    pub fn drain_released(
        &mut self,
        vbucket: u16,
        persisted: &PersistedSeqnos,
    ) -> Vec<(u64, T)> {
        let Some(cursor) = persisted.get(vbucket) else {
            return Vec::new();
        };
        let Some(queue) = self.queues.get_mut(&vbucket) else {
            return Vec::new();
        };
        let mut released = Vec::new();
        while let Some((seqno, _)) = queue.front() {
            if *seqno > cursor {
                break;
            }
            released.push(queue.pop_front().unwrap());
        }
        if !released.is_empty() {
            debug!(vbucket, n = released.len(), cursor, "mitigation release");
        }
        released
    }

    /// Discard everything buffered for `vbucket` without delivery.
    pub fn clear(&mut self, vbucket: u16) -> usize {
        self.queues.remove(&vbucket).map_or(0, |q| q.len())
    }

    /// Discard all buffers (channel drop / topology change).
    pub fn clear_all(&mut self) -> usize {
        let total = self.queues.values().map(VecDeque::len).sum();
        self.queues.clear();
        total
    }
}
