//! The conductor: cluster-map-driven channel lifecycle and stream placement.
//!
//! Edge-triggered on arbiter updates.  Each reconciliation pass computes the
//! set of nodes that own at least one requested vbucket, closes channels
//! that lost their last assignment, opens channels for new owners, and
//! (re)issues stream opens built from session state.  Reconciliation is
//! idempotent: re-applying the current map changes nothing.
//!
//! Streams are only ever placed on a vbucket's active node, never a replica.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use dcp_protocol::status_name;

use crate::channel::{
    ChannelCommand, ChannelEvent, ChannelHandle, ChannelShared, EndSpec, spawn_channel,
};
use crate::error::DcpError;
use crate::topology::ClusterMap;

const BACKOFF_FLOOR: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Host-side requests routed through the client facade.
#[derive(Debug)]
pub(crate) enum ConductorCommand {
    StreamPartitions {
        vbuckets: Vec<u16>,
        from_now: bool,
        end: EndSpec,
    },
    StopPartitions {
        vbuckets: Vec<u16>,
    },
}

/// Why a vbucket is on the books and how far it should stream.
#[derive(Debug, Clone, Copy)]
struct PartitionRequest {
    from_now: bool,
    end: EndSpec,
}

pub(crate) struct Conductor {
    shared: ChannelShared,
    channels: HashMap<SocketAddr, ChannelHandle>,
    /// Vbuckets the host asked to stream, minus those that reached a
    /// terminal end.
    requested: HashMap<u16, PartitionRequest>,
    /// Which node currently hosts each requested vbucket's stream.
    placements: HashMap<u16, SocketAddr>,
    /// Consecutive failures per node, for reconnect backoff.
    failures: HashMap<SocketAddr, u32>,
    /// Nodes with permanent handshake failures; never retried.
    dead_nodes: HashSet<SocketAddr>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    nudge_tx: mpsc::UnboundedSender<()>,
    nudge_rx: mpsc::UnboundedReceiver<()>,
    shutdown: watch::Receiver<bool>,
}

impl Conductor {
    pub fn new(shared: ChannelShared, shutdown: watch::Receiver<bool>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (nudge_tx, nudge_rx) = mpsc::unbounded_channel();
        Conductor {
            shared,
            channels: HashMap::new(),
            requested: HashMap::new(),
            placements: HashMap::new(),
            failures: HashMap::new(),
            dead_nodes: HashSet::new(),
            events_tx,
            events_rx,
            nudge_tx,
            nudge_rx,
            shutdown,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ConductorCommand>) {
        let mut map_rx = self.shared.arbiter.subscribe();
        loop {
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                changed = map_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.reconcile();
                }
                Some(command) = commands.recv() => {
                    self.handle_command(command);
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event);
                }
                Some(()) = self.nudge_rx.recv() => {
                    self.reconcile();
                }
            }
        }
        // Dropping the handles closes every channel; in-flight frames are
        // drained by the dying tasks, not delivered.
        self.channels.clear();
        info!("conductor stopped");
    }

    fn current_map(&self) -> Option<Arc<ClusterMap>> {
        self.shared.arbiter.current()
    }

    // -- host commands ------------------------------------------------------

    fn handle_command(&mut self, command: ConductorCommand) {
        match command {
            ConductorCommand::StreamPartitions {
                vbuckets,
                from_now,
                end,
            } => {
                for vbucket in vbuckets {
                    self.requested
                        .entry(vbucket)
                        .or_insert(PartitionRequest { from_now, end });
                }
                self.reconcile();
            }
            ConductorCommand::StopPartitions { vbuckets } => {
                for vbucket in vbuckets {
                    self.requested.remove(&vbucket);
                    if let Some(node) = self.placements.remove(&vbucket)
                        && let Some(channel) = self.channels.get(&node)
                    {
                        channel.send(ChannelCommand::CloseStream { vbucket });
                    }
                }
                self.reconcile();
            }
        }
    }

    // -- channel events -----------------------------------------------------

    fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Ready { node } => {
                self.failures.remove(&node);
                self.place_streams_on(node);
            }
            ChannelEvent::HandshakeFailed { node, error } => {
                self.channels.remove(&node);
                let permanent = !error.is_recoverable();
                self.listener_failure(error);
                if permanent {
                    warn!(%node, "node marked dead after permanent handshake failure");
                    self.dead_nodes.insert(node);
                } else {
                    self.schedule_retry(node);
                }
            }
            ChannelEvent::StreamOpened {
                node,
                vbucket,
                end_seqno,
            } => {
                debug!(%node, vbucket, end_seqno, "stream placed");
                self.placements.insert(vbucket, node);
                if let Some(request) = self.requested.get_mut(&vbucket) {
                    // NOW bounds are materialized once; a reopen must not
                    // re-capture a later snapshot.
                    request.from_now = false;
                    if request.end == EndSpec::Now {
                        request.end = EndSpec::Seqno(end_seqno);
                    }
                }
            }
            ChannelEvent::StreamEnded {
                node,
                vbucket,
                reason,
            } => {
                self.placements.remove(&vbucket);
                if reason.is_terminal() {
                    self.requested.remove(&vbucket);
                } else {
                    debug!(%node, vbucket, ?reason, "stream ended, reopening");
                    self.reconcile();
                }
            }
            ChannelEvent::StreamFailed {
                node,
                vbucket,
                status,
            } => {
                warn!(%node, vbucket, status = status_name(status), "stream open refused");
                self.placements.remove(&vbucket);
                self.listener_failure(DcpError::StreamOpenFailed { vbucket, status });
                // NOT_MY_VBUCKET and friends resolve on the next map; ask
                // for a fresh one.
                if let Some(channel) = self.channels.get(&node) {
                    channel.send(ChannelCommand::RefreshConfig);
                }
            }
            ChannelEvent::Dropped { node, error } => {
                self.channels.remove(&node);
                self.placements.retain(|_, owner| *owner != node);
                self.listener_failure(error);
                self.schedule_retry(node);
            }
        }
    }

    fn listener_failure(&self, error: DcpError) {
        self.shared
            .listener
            .read()
            .expect("listener lock poisoned")
            .clone()
            .on_failure(error);
    }

    fn schedule_retry(&mut self, node: SocketAddr) {
        let attempt = {
            let failures = self.failures.entry(node).or_insert(0);
            *failures += 1;
            *failures
        };
        let delay = (BACKOFF_FLOOR * 2u32.saturating_pow(attempt - 1)).min(BACKOFF_CAP);
        debug!(%node, attempt, ?delay, "scheduling reconnect");
        let nudge = self.nudge_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = nudge.send(());
        });
    }

    // -- reconciliation -----------------------------------------------------

    /// Bring channels and stream placement in line with the current map.
    fn reconcile(&mut self) {
        let Some(map) = self.current_map() else {
            return;
        };

        let of_interest: Vec<u16> = self.requested.keys().copied().collect();
        let mut desired: HashMap<SocketAddr, Vec<u16>> = HashMap::new();
        for &vbucket in &of_interest {
            if let Some(node) = map.active_node(vbucket) {
                desired.entry(node).or_default().push(vbucket);
            }
        }

        // Close channels whose node lost every assignment or left the map.
        // Session state survives; only the connections go away.
        let stale: Vec<SocketAddr> = self
            .channels
            .keys()
            .copied()
            .filter(|node| !desired.contains_key(node))
            .collect();
        for node in stale {
            info!(%node, "closing channel with no remaining vbuckets");
            self.channels.remove(&node);
            self.placements.retain(|_, owner| *owner != node);
        }

        // Migrate streams whose active copy moved.
        let placed: Vec<(u16, SocketAddr)> =
            self.placements.iter().map(|(v, n)| (*v, *n)).collect();
        for (vbucket, owner) in placed {
            let wanted = map.active_node(vbucket);
            if wanted != Some(owner)
                && let Some(channel) = self.channels.get(&owner)
            {
                debug!(vbucket, from = %owner, to = ?wanted, "vbucket migrated, closing stream");
                channel.send(ChannelCommand::CloseStream { vbucket });
            }
        }

        // Open channels for new owners and place their streams.
        for (&node, _) in &desired {
            if self.dead_nodes.contains(&node) {
                continue;
            }
            if !self.channels.contains_key(&node) {
                info!(%node, "opening channel");
                let handle = spawn_channel(
                    node,
                    self.shared.clone(),
                    self.events_tx.clone(),
                    self.shutdown.clone(),
                );
                self.channels.insert(node, handle);
                // Streams are placed once the channel reports Ready.
            } else {
                self.place_streams_on(node);
            }
        }
    }

    /// Issue stream opens for every requested vbucket this node owns and
    /// which is not already placed.
    fn place_streams_on(&mut self, node: SocketAddr) {
        let Some(map) = self.current_map() else {
            return;
        };
        let Some(channel) = self.channels.get(&node) else {
            return;
        };
        let of_interest: Vec<u16> = self.requested.keys().copied().collect();
        for vbucket in map.owned_vbuckets(node, &of_interest) {
            if self.placements.contains_key(&vbucket) {
                continue;
            }
            let request = self.requested[&vbucket];
            channel.send(ChannelCommand::OpenStream {
                vbucket,
                from_now: request.from_now,
                end: request.end,
            });
        }
    }
}
