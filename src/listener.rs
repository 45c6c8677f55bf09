//! The application-facing change listener.
//!
//! Hosts implement [`DatabaseChangeListener`] and register it on the client.
//! Every hook except `on_failure` defaults to a no-op, so a minimal consumer
//! only needs mutations and failures.  Callbacks run on the owning channel's
//! I/O task: block here and you stall that channel (and only that channel).

use tokio::sync::mpsc;

use dcp_protocol::{
    Deletion, Expiration, FailoverLogEntry, Mutation, OsoSnapshot, SeqnoAdvanced,
    SnapshotMarker, StreamEndReason, SystemEvent,
};

use crate::error::DcpError;

// ---------------------------------------------------------------------------
// Flow-control ack handle
// ---------------------------------------------------------------------------

/// Returns flow-control credit for one delivered event.
///
/// In `Manual` mode the application must call [`AckHandle::ack`] once it has
/// consumed the event; in the auto modes the client calls it internally.
/// Dropping the handle without acking withholds the credit; a stream stalled
/// this way is reported as a failure, not retried.
#[derive(Debug)]
pub struct AckHandle {
    bytes: u32,
    tx: Option<mpsc::UnboundedSender<u32>>,
}

impl AckHandle {
    pub(crate) fn new(bytes: u32, tx: mpsc::UnboundedSender<u32>) -> Self {
        AckHandle {
            bytes,
            tx: Some(tx),
        }
    }

    /// Handle for the auto modes: credit was already returned by the
    /// channel, so `ack` is a no-op and double-crediting is impossible.
    pub(crate) fn pre_acked(bytes: u32) -> Self {
        AckHandle { bytes, tx: None }
    }

    /// How many bytes of server buffer this event occupies (header included).
    pub fn bytes(&self) -> u32 {
        self.bytes
    }

    /// Return the credit to the channel.
    pub fn ack(self) {
        if let Some(tx) = self.tx {
            let _ = tx.send(self.bytes);
        }
    }
}

// ---------------------------------------------------------------------------
// Rollback override
// ---------------------------------------------------------------------------

/// Listener decision for an in-band rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackAction {
    /// Resume from the server-suggested seqno (the default).
    #[default]
    Resume,
    /// Refuse the rollback: the vbucket stream stops and
    /// [`DatabaseChangeListener::on_failure`] receives a fatal error.
    Veto,
}

// ---------------------------------------------------------------------------
// Listener trait
// ---------------------------------------------------------------------------

/// Receives every observable event of the change feed.
///
/// Per-vbucket total order is guaranteed across all hooks; no ordering holds
/// between different vbuckets.
#[allow(unused_variables)]
pub trait DatabaseChangeListener: Send + Sync + 'static {
    fn on_mutation(&self, mutation: Mutation, ack: AckHandle) {
        ack.ack();
    }

    fn on_deletion(&self, deletion: Deletion, ack: AckHandle) {
        ack.ack();
    }

    fn on_expiration(&self, expiration: Expiration, ack: AckHandle) {
        ack.ack();
    }

    /// Offset advanced without a delivered change (collections mode).
    /// Flow-control credit for the frame is returned automatically.
    fn on_seqno_advanced(&self, advance: SeqnoAdvanced) {}

    fn on_snapshot(&self, marker: SnapshotMarker, ack: AckHandle) {
        ack.ack();
    }

    /// Scope/collection create/drop/flush, delivered only when the channel
    /// is collections-aware and the event passes the configured filter.
    fn on_system_event(&self, event: SystemEvent, ack: AckHandle) {
        ack.ack();
    }

    /// An out-of-sequence-order region begins or ends on this vbucket.
    fn on_oso_snapshot(&self, oso: OsoSnapshot, ack: AckHandle) {
        ack.ack();
    }

    /// Informational override point; return [`RollbackAction::Veto`] to stop
    /// the vbucket instead of resuming from `rollback_seqno`.
    fn on_rollback(&self, vbucket: u16, rollback_seqno: u64) -> RollbackAction {
        RollbackAction::Resume
    }

    /// A stream open (or rollback retry) replaced the failover log.
    fn on_failover_log(&self, vbucket: u16, log: &[FailoverLogEntry]) {}

    fn on_stream_end(&self, vbucket: u16, reason: StreamEndReason) {}

    /// Required: terminal and non-terminal failures the client cannot hide.
    fn on_failure(&self, error: DcpError);
}

/// Listener used before the host registers one; drops events, logs failures.
pub(crate) struct NullListener;

impl DatabaseChangeListener for NullListener {
    fn on_failure(&self, error: DcpError) {
        tracing::warn!(error = %error, "failure with no listener registered");
    }
}
