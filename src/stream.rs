//! Per-vbucket stream state machine.
//!
//! A [`VbucketStream`] interprets the frames the channel routes to it and
//! turns them into typed actions for the channel to act on (deliver to the
//! listener, retry the open, tear the channel down).  It owns no I/O; the
//! channel task drives it.
//!
//! The machine tracks its snapshot window locally.  Checkpoint updates to
//! the shared session store travel alongside each action and are applied by
//! the channel at delivery time -- immediately in the direct path, at
//! release time under rollback mitigation.  The store therefore never gets
//! ahead of what the listener has observed.
//!
//! Phases: `Idle -> Opening -> Open -> Ended`, with `RollingBack` as a
//! transient side state of `Opening`.

use bytes::Buf;
use tracing::{debug, warn};

use dcp_protocol::{
    Deletion, Expiration, Frame, Mutation, OsoSnapshot, SeqnoAdvanced, SnapshotMarker,
    StreamEndMessage, StreamEndReason, StreamRequestParams, SystemEvent, opcode, oso_flags,
    parse_failover_log, parse_rollback_seqno, status,
};

use crate::session::SessionStore;

// ---------------------------------------------------------------------------
// Phases, actions, checkpoint updates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Opening,
    RollingBack,
    Open,
    Ended(StreamEndReason),
}

/// Outcome of a stream-open (or rollback retry) response.
#[derive(Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Stream is live; the failover log was applied to the session store.
    Opened,
    /// Server demanded a rewind; session state was updated and the channel
    /// should re-issue this request.
    Retry { request: StreamRequestParams },
    /// The listener vetoed the rollback; the vbucket stops.
    Vetoed { rollback_seqno: u64 },
    /// Any other non-success status; terminal for this attempt.
    Failed { status: u16 },
}

/// One observable change, ready for listener dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Mutation(Mutation),
    Deletion(Deletion),
    Expiration(Expiration),
    Snapshot(SnapshotMarker),
    SystemEvent(SystemEvent),
    OsoSnapshot(OsoSnapshot),
    /// Offset advance with no document attached; surfaced through the
    /// dedicated listener hook, never as a mutation.
    SeqnoAdvanced(SeqnoAdvanced),
}

impl ChangeEvent {
    pub fn by_seqno(&self) -> Option<u64> {
        match self {
            ChangeEvent::Mutation(m) => Some(m.by_seqno),
            ChangeEvent::Deletion(d) => Some(d.by_seqno),
            ChangeEvent::Expiration(e) => Some(e.by_seqno),
            ChangeEvent::SystemEvent(s) => Some(s.by_seqno),
            ChangeEvent::SeqnoAdvanced(a) => Some(a.by_seqno),
            ChangeEvent::Snapshot(_) | ChangeEvent::OsoSnapshot(_) => None,
        }
    }
}

/// Checkpoint mutation for the session store, applied when the matching
/// event reaches the listener (or is consumed without delivery).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUpdate {
    /// New snapshot window bounds.
    Window { start: u64, end: u64 },
    /// Offset advanced inside the current window.
    Offset {
        seqno: u64,
        manifest_uid: Option<u64>,
    },
    /// Window and offset collapse to a single seqno (seqno-advance, OSO
    /// region end).
    Collapse { seqno: u64 },
}

impl SessionUpdate {
    /// Apply this checkpoint update to the store.
    pub fn apply(self, session: &SessionStore, vbucket: u16) {
        session.update(vbucket, |state| match self {
            SessionUpdate::Window { start, end } => state.set_snapshot(start, end),
            SessionUpdate::Offset { seqno, manifest_uid } => {
                state.advance(seqno);
                if let Some(uid) = manifest_uid {
                    state.collections_manifest_uid = uid;
                }
            }
            SessionUpdate::Collapse { seqno } => {
                state.set_snapshot(seqno, seqno);
                if seqno > state.seqno {
                    state.advance(seqno);
                }
            }
        });
    }

    /// The seqno gating release under rollback mitigation.
    pub fn gate(self) -> u64 {
        match self {
            SessionUpdate::Window { start, .. } => start,
            SessionUpdate::Offset { seqno, .. } | SessionUpdate::Collapse { seqno } => seqno,
        }
    }
}

/// What the channel must do with a routed frame.
#[derive(Debug, PartialEq, Eq)]
pub enum EventAction {
    /// Hand to the listener (through mitigation if enabled), applying the
    /// checkpoint update at delivery.
    Deliver(ChangeEvent, Option<SessionUpdate>),
    /// Apply the checkpoint update (if any) and return flow-control credit
    /// without listener delivery (filtered system event, late frame).
    Consume(Option<SessionUpdate>),
    /// Stream is over; reason OK is terminal, others re-open.
    End(StreamEndReason),
    /// Server broke the protocol; the whole channel must die.
    Violation(String),
}

// ---------------------------------------------------------------------------
// The state machine
// ---------------------------------------------------------------------------

/// One vbucket's stream machine.  The channel keys it by the open
/// request's opaque, which the server echoes on every event frame of the
/// stream.
#[derive(Debug)]
pub struct VbucketStream {
    vbucket: u16,
    phase: StreamPhase,
    end_seqno: u64,
    collections_aware: bool,
    /// Live window and offset, tracked locally so checkpointing can lag
    /// delivery.
    window_start: u64,
    window_end: u64,
    last_seqno: u64,
    /// Inside an out-of-sequence-order region the window check is suspended
    /// and the offset only moves at region end.
    oso_active: bool,
    oso_max_seqno: u64,
}

impl VbucketStream {
    /// `params` carries the resume point the open request was built from;
    /// the live window starts there.
    pub fn new(vbucket: u16, params: &StreamRequestParams, collections_aware: bool) -> Self {
        VbucketStream {
            vbucket,
            phase: StreamPhase::Idle,
            end_seqno: params.end_seqno,
            collections_aware,
            window_start: params.snapshot_start,
            window_end: params.snapshot_end,
            last_seqno: params.start_seqno,
            oso_active: false,
            oso_max_seqno: 0,
        }
    }

    pub fn vbucket(&self) -> u16 {
        self.vbucket
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn end_seqno(&self) -> u64 {
        self.end_seqno
    }

    pub fn mark_opening(&mut self) {
        self.phase = StreamPhase::Opening;
    }

    /// Synthesize an end when the channel dies under the stream.
    pub fn mark_channel_dropped(&mut self) {
        self.phase = StreamPhase::Ended(StreamEndReason::ChannelDropped);
    }

    /// Handle the DCP_STREAM_REQ response.
    ///
    /// `veto_rollback` is the listener's rollback decision (true = refuse),
    /// collected by the channel.
    pub fn handle_open_response(
        &mut self,
        frame: &Frame,
        session: &SessionStore,
        veto_rollback: impl FnOnce(u64) -> bool,
    ) -> OpenOutcome {
        match frame.status() {
            status::SUCCESS => {
                let Ok(entries) = parse_failover_log(&frame.value) else {
                    self.phase = StreamPhase::Ended(StreamEndReason::ChannelDropped);
                    return OpenOutcome::Failed {
                        status: frame.status(),
                    };
                };
                session.update(self.vbucket, |state| state.apply_failover_log(&entries));
                self.phase = StreamPhase::Open;
                debug!(vbucket = self.vbucket, entries = entries.len(), "stream open");
                OpenOutcome::Opened
            }
            status::ROLLBACK => {
                let Ok(rollback_seqno) = parse_rollback_seqno(frame) else {
                    self.phase = StreamPhase::Ended(StreamEndReason::Rollback);
                    return OpenOutcome::Failed {
                        status: frame.status(),
                    };
                };
                if veto_rollback(rollback_seqno) {
                    self.phase = StreamPhase::Ended(StreamEndReason::Rollback);
                    return OpenOutcome::Vetoed { rollback_seqno };
                }
                self.phase = StreamPhase::RollingBack;
                let request = session.update(self.vbucket, |state| {
                    state.apply_rollback(rollback_seqno);
                    state.stream_request(self.end_seqno)
                });
                self.window_start = request.snapshot_start;
                self.window_end = request.snapshot_end;
                self.last_seqno = request.start_seqno;
                warn!(
                    vbucket = self.vbucket,
                    rollback_seqno, "rolling back and retrying stream open"
                );
                OpenOutcome::Retry { request }
            }
            other => {
                self.phase = StreamPhase::Ended(StreamEndReason::ChannelDropped);
                OpenOutcome::Failed { status: other }
            }
        }
    }

    /// Re-entering `Opening` after a rollback retry was issued.
    pub fn mark_retrying(&mut self) {
        self.phase = StreamPhase::Opening;
    }

    /// Handle a server-initiated DCP event frame tagged with this stream's
    /// opaque.
    pub fn handle_event(&mut self, frame: &Frame) -> EventAction {
        if self.phase != StreamPhase::Open {
            // Late frames race with stream end on a busy channel.
            return EventAction::Consume(None);
        }
        match frame.opcode {
            opcode::DCP_SNAPSHOT_MARKER => match SnapshotMarker::parse(frame) {
                Ok(marker) => {
                    self.window_start = marker.start_seqno;
                    self.window_end = marker.end_seqno;
                    let update = SessionUpdate::Window {
                        start: marker.start_seqno,
                        end: marker.end_seqno,
                    };
                    EventAction::Deliver(ChangeEvent::Snapshot(marker), Some(update))
                }
                Err(e) => EventAction::Violation(e.to_string()),
            },
            opcode::DCP_MUTATION => match Mutation::parse(frame) {
                Ok(mutation) => {
                    let seqno = mutation.by_seqno;
                    self.data_event(seqno, ChangeEvent::Mutation(mutation), None)
                }
                Err(e) => EventAction::Violation(e.to_string()),
            },
            opcode::DCP_DELETION => match Deletion::parse(frame) {
                Ok(deletion) => {
                    let seqno = deletion.by_seqno;
                    self.data_event(seqno, ChangeEvent::Deletion(deletion), None)
                }
                Err(e) => EventAction::Violation(e.to_string()),
            },
            opcode::DCP_EXPIRATION => match Expiration::parse(frame) {
                Ok(expiration) => {
                    let seqno = expiration.by_seqno;
                    self.data_event(seqno, ChangeEvent::Expiration(expiration), None)
                }
                Err(e) => EventAction::Violation(e.to_string()),
            },
            opcode::DCP_SEQNO_ADVANCED => match SeqnoAdvanced::parse(frame) {
                Ok(advance) => {
                    // Moves the offset without carrying a change; the
                    // listener hears about it through on_seqno_advanced.
                    self.window_start = advance.by_seqno;
                    self.window_end = advance.by_seqno;
                    self.last_seqno = advance.by_seqno;
                    let update = SessionUpdate::Collapse {
                        seqno: advance.by_seqno,
                    };
                    EventAction::Deliver(ChangeEvent::SeqnoAdvanced(advance), Some(update))
                }
                Err(e) => EventAction::Violation(e.to_string()),
            },
            opcode::DCP_SYSTEM_EVENT => match SystemEvent::parse(frame) {
                Ok(event) => {
                    let manifest_uid = if event.value.len() >= 8 {
                        let mut uid = event.value.clone();
                        Some(uid.get_u64())
                    } else {
                        None
                    };
                    let seqno = event.by_seqno;
                    if self.collections_aware {
                        self.data_event(seqno, ChangeEvent::SystemEvent(event), manifest_uid)
                    } else {
                        self.last_seqno = seqno;
                        EventAction::Consume(Some(SessionUpdate::Offset {
                            seqno,
                            manifest_uid,
                        }))
                    }
                }
                Err(e) => EventAction::Violation(e.to_string()),
            },
            opcode::DCP_OSO_SNAPSHOT => match OsoSnapshot::parse(frame) {
                Ok(oso) => {
                    let mut update = None;
                    if oso.flags & oso_flags::START != 0 {
                        self.oso_active = true;
                        self.oso_max_seqno = self.last_seqno;
                    } else if oso.flags & oso_flags::END != 0 {
                        self.oso_active = false;
                        self.last_seqno = self.oso_max_seqno;
                        self.window_start = self.oso_max_seqno;
                        self.window_end = self.oso_max_seqno;
                        update = Some(SessionUpdate::Collapse {
                            seqno: self.oso_max_seqno,
                        });
                    }
                    EventAction::Deliver(ChangeEvent::OsoSnapshot(oso), update)
                }
                Err(e) => EventAction::Violation(e.to_string()),
            },
            opcode::DCP_STREAM_END => match StreamEndMessage::parse(frame) {
                Ok(end) => {
                    self.phase = StreamPhase::Ended(end.reason);
                    EventAction::End(end.reason)
                }
                Err(e) => EventAction::Violation(e.to_string()),
            },
            other => EventAction::Violation(format!(
                "unexpected opcode 0x{other:02x} on stream for vbucket {}",
                self.vbucket
            )),
        }
    }

    /// Common handling for mutation-like events: window check + offset
    /// advance.  OSO regions suspend the window check and defer the offset.
    fn data_event(
        &mut self,
        by_seqno: u64,
        event: ChangeEvent,
        manifest_uid: Option<u64>,
    ) -> EventAction {
        if self.oso_active {
            self.oso_max_seqno = self.oso_max_seqno.max(by_seqno);
            return EventAction::Deliver(event, None);
        }
        if by_seqno < self.window_start || by_seqno > self.window_end {
            return EventAction::Violation(format!(
                "seqno {by_seqno} outside snapshot window [{}, {}] on vbucket {}",
                self.window_start, self.window_end, self.vbucket
            ));
        }
        self.last_seqno = by_seqno;
        EventAction::Deliver(
            event,
            Some(SessionUpdate::Offset {
                seqno: by_seqno,
                manifest_uid,
            }),
        )
    }
}
