//! Per-node DCP channel: handshake, steady-state dispatch, keepalive.
//!
//! One channel owns one TCP connection to one data node for one bucket.
//! The conductor creates and destroys channels; each channel runs a single
//! I/O task that decodes frames, correlates responses by opaque, drives the
//! per-vbucket stream machines, and reports lifecycle events back to the
//! conductor over a queue.  Work across channels is parallel; within a
//! channel everything is serialized on the I/O task.
//!
//! # Handshake
//! `CONNECTING -> AUTH -> HELLO -> SELECT_BUCKET -> DCP_OPEN -> DCP_CONTROL
//! -> READY`, every phase bounded by `socket_connect_timeout + grace`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use dcp_protocol::{
    END_SEQNO_INFINITY, Frame, FrameCodec, ObserveSeqnoResponse, StreamEndReason, feature,
    magic, opcode, open_flags, parse_failover_log, parse_hello_response, status,
};

use crate::config::{ClientConfig, FlowControlMode};
use crate::error::DcpError;
use crate::flow::FlowControl;
use crate::listener::{AckHandle, DatabaseChangeListener, RollbackAction};
use crate::mitigation::{MitigationBuffer, PersistedSeqnos};
use crate::session::SessionStore;
use crate::stream::{
    ChangeEvent, EventAction, OpenOutcome, SessionUpdate, StreamPhase, VbucketStream,
};
use crate::topology::BucketConfigArbiter;

pub(crate) type SharedListener = Arc<std::sync::RwLock<Arc<dyn DatabaseChangeListener>>>;

/// Mitigation-buffer entry: listener event (if any), checkpoint update (if
/// any), and the frame's wire size for flow-control credit.
type Withheld = (Option<ChangeEvent>, Option<SessionUpdate>, u32);

// ---------------------------------------------------------------------------
// Commands and events
// ---------------------------------------------------------------------------

/// Where a stream should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndSpec {
    /// Capture the current high seqno at open and stop there.
    Now,
    Infinity,
    Seqno(u64),
}

/// Conductor-to-channel requests.
#[derive(Debug)]
pub(crate) enum ChannelCommand {
    OpenStream {
        vbucket: u16,
        /// Start from the current high seqno instead of session state.
        from_now: bool,
        end: EndSpec,
    },
    CloseStream {
        vbucket: u16,
    },
    /// Re-fetch the cluster config in-band.
    RefreshConfig,
}

/// Channel-to-conductor notifications.
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    Ready {
        node: SocketAddr,
    },
    HandshakeFailed {
        node: SocketAddr,
        error: DcpError,
    },
    /// Stream open succeeded; `end_seqno` is the resolved end (NOW captured).
    StreamOpened {
        node: SocketAddr,
        vbucket: u16,
        end_seqno: u64,
    },
    StreamEnded {
        node: SocketAddr,
        vbucket: u16,
        reason: StreamEndReason,
    },
    /// Stream open failed with a non-success, non-rollback status.
    StreamFailed {
        node: SocketAddr,
        vbucket: u16,
        status: u16,
    },
    Dropped {
        node: SocketAddr,
        error: DcpError,
    },
}

/// Conductor-held handle to a running channel task.  Dropping it closes
/// the channel.
#[derive(Debug)]
pub(crate) struct ChannelHandle {
    commands: mpsc::UnboundedSender<ChannelCommand>,
}

impl ChannelHandle {
    pub fn send(&self, command: ChannelCommand) {
        let _ = self.commands.send(command);
    }
}

/// State shared by every channel of one client.
#[derive(Clone)]
pub(crate) struct ChannelShared {
    pub config: Arc<ClientConfig>,
    pub session: Arc<SessionStore>,
    pub arbiter: Arc<BucketConfigArbiter>,
    pub listener: SharedListener,
}

/// Spawn the channel I/O task for `node`.
pub(crate) fn spawn_channel(
    node: SocketAddr,
    shared: ChannelShared,
    events: mpsc::UnboundedSender<ChannelEvent>,
    shutdown: watch::Receiver<bool>,
) -> ChannelHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_channel(node, shared, command_rx, events, shutdown));
    ChannelHandle {
        commands: command_tx,
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Features recorded from the HELLO response.
#[derive(Debug, Clone, Default)]
struct Negotiated {
    collections: bool,
    clustermap_push: bool,
}

impl Negotiated {
    fn from_honored(honored: &[u16]) -> Self {
        Negotiated {
            collections: honored.contains(&feature::COLLECTIONS),
            clustermap_push: honored.contains(&feature::CLUSTERMAP_CHANGE_NOTIFICATION),
        }
    }
}

type DcpFramed = Framed<TcpStream, FrameCodec>;

async fn run_channel(
    node: SocketAddr,
    shared: ChannelShared,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    shutdown: watch::Receiver<bool>,
) {
    let mut opaque = 0u32;
    let (framed, negotiated) = match handshake(node, &shared, &mut opaque).await {
        Ok(ready) => ready,
        Err(error) => {
            warn!(%node, %error, "channel handshake failed");
            let _ = events.send(ChannelEvent::HandshakeFailed { node, error });
            return;
        }
    };
    info!(
        %node,
        collections = negotiated.collections,
        clustermap_push = negotiated.clustermap_push,
        "channel ready"
    );
    let _ = events.send(ChannelEvent::Ready { node });

    let mut runner = ChannelRunner::new(node, shared, framed, negotiated, events, opaque);
    runner.run(commands, shutdown).await;
}

/// Send one request and wait for its response, servicing server-pushed
/// frames that interleave.
async fn handshake_roundtrip(
    framed: &mut DcpFramed,
    arbiter: &BucketConfigArbiter,
    request: Frame,
) -> Result<Frame, DcpError> {
    let opaque = request.opaque;
    framed
        .send(request)
        .await
        .map_err(|e| DcpError::ChannelDropped(e.to_string()))?;
    loop {
        let frame = match framed.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(DcpError::from_codec(e)),
            None => return Err(DcpError::ChannelDropped("connection closed".into())),
        };
        if frame.is_server_request() {
            service_server_request(framed, arbiter, &frame).await?;
            continue;
        }
        if frame.magic == magic::REQUEST && frame.opcode == opcode::DCP_NOOP {
            framed
                .send(dcp_protocol::noop_reply(frame.opaque))
                .await
                .map_err(|e| DcpError::ChannelDropped(e.to_string()))?;
            continue;
        }
        if frame.is_response() && frame.opaque == opaque {
            return Ok(frame);
        }
        debug!(opcode = frame.opcode, "unexpected frame during handshake, dropped");
    }
}

async fn service_server_request(
    framed: &mut DcpFramed,
    arbiter: &BucketConfigArbiter,
    frame: &Frame,
) -> Result<(), DcpError> {
    if frame.opcode == opcode::CLUSTERMAP_CHANGE_NOTIFICATION {
        if let Err(error) = arbiter.offer_raw(&frame.value) {
            warn!(%error, "ignoring unparseable pushed cluster config");
        }
        return Ok(());
    }
    framed
        .send(dcp_protocol::server_reply_not_supported(frame))
        .await
        .map_err(|e| DcpError::ChannelDropped(e.to_string()))
}

fn handshake_error(
    phase: &'static str,
    detail: impl Into<String>,
    permanent: bool,
) -> DcpError {
    DcpError::HandshakeFailure {
        phase,
        detail: detail.into(),
        permanent,
    }
}

/// One handshake phase: tag the request with a fresh opaque, send it, and
/// wait for the matching response under the phase deadline.
async fn handshake_step(
    phase: &'static str,
    phase_timeout: Duration,
    framed: &mut DcpFramed,
    arbiter: &BucketConfigArbiter,
    opaque: &mut u32,
    mut frame: Frame,
) -> Result<Frame, DcpError> {
    *opaque += 1;
    frame.opaque = *opaque;
    tokio::time::timeout(phase_timeout, handshake_roundtrip(framed, arbiter, frame))
        .await
        .map_err(|_| handshake_error(phase, "timed out", false))?
}

async fn handshake(
    node: SocketAddr,
    shared: &ChannelShared,
    opaque: &mut u32,
) -> Result<(DcpFramed, Negotiated), DcpError> {
    let config = &shared.config;
    let arbiter = &shared.arbiter;
    let phase_timeout = config.handshake_timeout();

    let connect = tokio::time::timeout(config.socket_connect_timeout, TcpStream::connect(node));
    let stream = match connect.await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(handshake_error("connect", e.to_string(), false)),
        Err(_) => return Err(handshake_error("connect", "connect timed out", false)),
    };
    stream.set_nodelay(true).ok();
    let mut framed = Framed::new(stream, FrameCodec);

    // AUTH
    let (username, password) = config.credentials.credentials_for(node);
    let response = handshake_step(
        "auth",
        phase_timeout,
        &mut framed,
        arbiter,
        opaque,
        dcp_protocol::sasl_auth_plain(&username, &password),
    )
    .await?;
    match response.status() {
        status::SUCCESS | status::AUTH_CONTINUE => {}
        status::AUTH_ERROR => {
            return Err(handshake_error("auth", "credentials rejected", true));
        }
        other => {
            return Err(handshake_error("auth", format!("status 0x{other:02x}"), false));
        }
    }

    // HELLO feature negotiation.
    let mut requested = vec![
        feature::TCP_NODELAY,
        feature::XERROR,
        feature::SELECT_BUCKET,
        feature::JSON,
        feature::DUPLEX,
        feature::CLUSTERMAP_CHANGE_NOTIFICATION,
    ];
    if config.features.xattrs {
        requested.push(feature::XATTR);
    }
    if config.features.snappy {
        requested.push(feature::SNAPPY);
    }
    if config.features.collections {
        requested.push(feature::COLLECTIONS);
    }
    let response = handshake_step(
        "hello",
        phase_timeout,
        &mut framed,
        arbiter,
        opaque,
        dcp_protocol::hello_request(&config.connection_name_prefix, &requested),
    )
    .await?;
    let honored = parse_hello_response(&response)
        .map_err(|e| handshake_error("hello", e.to_string(), false))?;
    let negotiated = Negotiated::from_honored(&honored);

    // SELECT_BUCKET
    let response = handshake_step(
        "select_bucket",
        phase_timeout,
        &mut framed,
        arbiter,
        opaque,
        dcp_protocol::select_bucket(&config.bucket),
    )
    .await?;
    match response.status() {
        status::SUCCESS => {}
        status::KEY_ENOENT => {
            return Err(handshake_error(
                "select_bucket",
                format!("no such bucket: {}", config.bucket),
                true,
            ));
        }
        status::NO_ACCESS => {
            return Err(handshake_error("select_bucket", "access denied", true));
        }
        other => {
            return Err(handshake_error(
                "select_bucket",
                format!("status 0x{other:02x}"),
                false,
            ));
        }
    }

    // DCP_OPEN
    let connection_name = format!(
        "{}-{}",
        config.connection_name_prefix,
        uuid::Uuid::new_v4()
    );
    let response = handshake_step(
        "dcp_open",
        phase_timeout,
        &mut framed,
        arbiter,
        opaque,
        dcp_protocol::open_connection(&connection_name, open_flags::PRODUCER),
    )
    .await?;
    if response.status() != status::SUCCESS {
        return Err(handshake_error(
            "dcp_open",
            format!("status 0x{:02x}", response.status()),
            false,
        ));
    }

    // DCP_CONTROL, fixed order; any rejection is fatal.
    for (key, value) in config.control.pairs() {
        let response = handshake_step(
            "dcp_control",
            phase_timeout,
            &mut framed,
            arbiter,
            opaque,
            dcp_protocol::control(&key, &value),
        )
        .await?;
        if response.status() != status::SUCCESS {
            return Err(handshake_error(
                "dcp_control",
                format!("{key} rejected with status 0x{:02x}", response.status()),
                true,
            ));
        }
    }

    // Seed the arbiter with this node's view of the topology.
    let response = handshake_step(
        "get_cluster_config",
        phase_timeout,
        &mut framed,
        arbiter,
        opaque,
        dcp_protocol::get_cluster_config(0),
    )
    .await?;
    if response.status() == status::SUCCESS
        && let Err(error) = arbiter.offer_raw(&response.value)
    {
        warn!(%error, "ignoring unparseable cluster config");
    }

    Ok((framed, negotiated))
}

// ---------------------------------------------------------------------------
// Steady state
// ---------------------------------------------------------------------------

/// Outstanding non-stream requests, by opaque.
#[derive(Debug)]
enum Pending {
    Noop,
    ClusterConfig,
    CloseStream {
        vbucket: u16,
    },
    /// OBSERVE_SEQNO issued by the mitigation poller.
    ObserveSeqno,
    /// GET_FAILOVER_LOG issued before a NOW capture on a fresh vbucket.
    FailoverLog {
        vbucket: u16,
        from_now: bool,
        end: EndSpec,
    },
    /// OBSERVE_SEQNO issued to capture "NOW" before a stream open.
    NowCapture {
        vbucket: u16,
        from_now: bool,
        end: EndSpec,
    },
}

struct ChannelRunner {
    node: SocketAddr,
    shared: ChannelShared,
    framed: DcpFramed,
    negotiated: Negotiated,
    events: mpsc::UnboundedSender<ChannelEvent>,
    /// Streams by opaque; the server echoes the open's opaque on every
    /// event frame of that stream.
    streams: HashMap<u32, VbucketStream>,
    by_vbucket: HashMap<u16, u32>,
    pending: HashMap<u32, Pending>,
    flow: FlowControl,
    ack_tx: mpsc::UnboundedSender<u32>,
    ack_rx: mpsc::UnboundedReceiver<u32>,
    /// Held events awaiting persistence, when mitigation is on.  Each entry
    /// carries the (optional) listener event, the (optional) checkpoint
    /// update to apply at release, and the frame's wire size.
    mitigation: Option<MitigationBuffer<Withheld>>,
    /// Active-copy persisted cursors from this channel's OBSERVE_SEQNO
    /// polls; dropped with the channel, repopulated after reconnect.
    persisted: PersistedSeqnos,
    last_rx: Instant,
    stall_reported: bool,
    opaque: u32,
}

impl ChannelRunner {
    fn new(
        node: SocketAddr,
        shared: ChannelShared,
        framed: DcpFramed,
        negotiated: Negotiated,
        events: mpsc::UnboundedSender<ChannelEvent>,
        opaque: u32,
    ) -> Self {
        let control = &shared.config.control;
        let flow = if control.connection_buffer_size > 0 {
            FlowControl::new(control.connection_buffer_size, control.ack_threshold)
        } else {
            FlowControl::disabled()
        };
        let mitigation = shared
            .config
            .mitigation
            .as_ref()
            .map(|_| MitigationBuffer::new());
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        ChannelRunner {
            node,
            shared,
            framed,
            negotiated,
            events,
            streams: HashMap::new(),
            by_vbucket: HashMap::new(),
            pending: HashMap::new(),
            flow,
            ack_tx,
            ack_rx,
            mitigation,
            persisted: PersistedSeqnos::new(),
            last_rx: Instant::now(),
            stall_reported: false,
            opaque,
        }
    }

    fn next_opaque(&mut self) -> u32 {
        self.opaque = self.opaque.wrapping_add(1);
        self.opaque
    }

    fn listener(&self) -> Arc<dyn DatabaseChangeListener> {
        self.shared
            .listener
            .read()
            .expect("listener lock poisoned")
            .clone()
    }

    async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let noop_interval = self.shared.config.control.noop_interval;
        let noop_enabled = self.shared.config.control.enable_noop;
        // Client-side NOOP cadence keeps an idle but healthy stream from
        // tripping the server's timeout.
        let mut noop_tick = tokio::time::interval(noop_interval.mul_f64(1.2));
        noop_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watchdog = tokio::time::interval(Duration::from_secs(1));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let poll_interval = self
            .shared
            .config
            .mitigation
            .as_ref()
            .map_or(Duration::from_secs(3600), |m| m.poll_interval);
        let mut mitigation_tick = tokio::time::interval(poll_interval);
        mitigation_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let error = loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break None;
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => {
                            if let Err(e) = self.handle_command(command).await {
                                break Some(e);
                            }
                        }
                        // Conductor dropped this channel: clean close.
                        None => break None,
                    }
                }
                Some(bytes) = self.ack_rx.recv() => {
                    if let Err(e) = self.credit(bytes).await {
                        break Some(e);
                    }
                }
                frame = self.framed.next() => {
                    match frame {
                        Some(Ok(frame)) => {
                            self.last_rx = Instant::now();
                            if let Err(e) = self.handle_frame(frame).await {
                                break Some(e);
                            }
                        }
                        Some(Err(e)) => break Some(DcpError::from_codec(e)),
                        None => break Some(DcpError::ChannelDropped("connection closed".into())),
                    }
                }
                _ = noop_tick.tick(), if noop_enabled => {
                    if let Err(e) = self.send_client_noop().await {
                        break Some(e);
                    }
                }
                _ = mitigation_tick.tick(), if self.mitigation.is_some() => {
                    if let Err(e) = self.mitigation_poll().await {
                        break Some(e);
                    }
                }
                _ = watchdog.tick() => {
                    if noop_enabled && self.last_rx.elapsed() > noop_interval * 2 {
                        break Some(DcpError::ChannelDropped(format!(
                            "no traffic for {}s",
                            self.last_rx.elapsed().as_secs()
                        )));
                    }
                    self.check_stall(noop_interval);
                }
            }
        };

        // Withheld events are discarded, never delivered: recovery resumes
        // from session state, which only reflects released offsets.
        if let Some(buffer) = &mut self.mitigation {
            let dropped = buffer.clear_all();
            if dropped > 0 {
                debug!(node = %self.node, dropped, "mitigation buffer cleared on channel close");
            }
        }

        match error {
            Some(error) => {
                warn!(node = %self.node, %error, "channel dropped");
                let listener = self.listener();
                for stream in self.streams.values_mut() {
                    stream.mark_channel_dropped();
                    listener.on_stream_end(stream.vbucket(), StreamEndReason::ChannelDropped);
                }
                let _ = self.events.send(ChannelEvent::Dropped {
                    node: self.node,
                    error,
                });
            }
            None => {
                debug!(node = %self.node, "channel closed");
                let _ = self.framed.close().await;
            }
        }
    }

    // -- command handling ---------------------------------------------------

    async fn handle_command(&mut self, command: ChannelCommand) -> Result<(), DcpError> {
        match command {
            ChannelCommand::OpenStream {
                vbucket,
                from_now,
                end,
            } => {
                if self.by_vbucket.contains_key(&vbucket) || self.open_pending(vbucket) {
                    return Ok(());
                }
                if from_now || end == EndSpec::Now {
                    self.begin_now_capture(vbucket, from_now, end).await
                } else {
                    let end_seqno = match end {
                        EndSpec::Infinity => END_SEQNO_INFINITY,
                        EndSpec::Seqno(s) => s,
                        EndSpec::Now => unreachable!("captured above"),
                    };
                    self.open_stream(vbucket, end_seqno).await
                }
            }
            ChannelCommand::CloseStream { vbucket } => {
                if !self.by_vbucket.contains_key(&vbucket) {
                    return Ok(());
                }
                let close_opaque = self.next_opaque();
                self.pending
                    .insert(close_opaque, Pending::CloseStream { vbucket });
                self.send(dcp_protocol::close_stream(vbucket, close_opaque))
                    .await
            }
            ChannelCommand::RefreshConfig => {
                let opaque = self.next_opaque();
                self.pending.insert(opaque, Pending::ClusterConfig);
                self.send(dcp_protocol::get_cluster_config(opaque)).await
            }
        }
    }

    /// Whether a capture chain is already in flight for `vbucket`.
    fn open_pending(&self, vbucket: u16) -> bool {
        self.pending.values().any(|p| {
            matches!(p,
                Pending::FailoverLog { vbucket: v, .. } | Pending::NowCapture { vbucket: v, .. }
                if *v == vbucket
            )
        })
    }

    /// A NOW-bounded open needs the current high seqno (and, on a fresh
    /// vbucket, a failover log to name a vbuuid) before the stream request
    /// can be built.
    async fn begin_now_capture(
        &mut self,
        vbucket: u16,
        from_now: bool,
        end: EndSpec,
    ) -> Result<(), DcpError> {
        let state = self.shared.session.get(vbucket);
        let opaque = self.next_opaque();
        if state.failover_log.is_empty() {
            self.pending.insert(
                opaque,
                Pending::FailoverLog {
                    vbucket,
                    from_now,
                    end,
                },
            );
            self.send(dcp_protocol::get_failover_log(vbucket, opaque))
                .await
        } else {
            self.pending.insert(
                opaque,
                Pending::NowCapture {
                    vbucket,
                    from_now,
                    end,
                },
            );
            self.send(dcp_protocol::observe_seqno(vbucket, state.vbuuid, opaque))
                .await
        }
    }

    async fn open_stream(&mut self, vbucket: u16, end_seqno: u64) -> Result<(), DcpError> {
        let opaque = self.next_opaque();
        let params = self.shared.session.get(vbucket).stream_request(end_seqno);
        let mut stream =
            VbucketStream::new(vbucket, &params, self.negotiated.collections);
        stream.mark_opening();
        self.streams.insert(opaque, stream);
        self.by_vbucket.insert(vbucket, opaque);
        debug!(
            node = %self.node,
            vbucket,
            start = params.start_seqno,
            end = params.end_seqno,
            "opening stream"
        );
        self.send(dcp_protocol::stream_request(vbucket, opaque, &params))
            .await
    }

    async fn send(&mut self, frame: Frame) -> Result<(), DcpError> {
        self.framed
            .send(frame)
            .await
            .map_err(|e| DcpError::ChannelDropped(e.to_string()))
    }

    async fn send_client_noop(&mut self) -> Result<(), DcpError> {
        let opaque = self.next_opaque();
        self.pending.insert(opaque, Pending::Noop);
        let mut frame = Frame::request(opcode::DCP_NOOP);
        frame.opaque = opaque;
        self.send(frame).await
    }

    // -- flow control -------------------------------------------------------

    async fn credit(&mut self, bytes: u32) -> Result<(), DcpError> {
        self.stall_reported = false;
        if let Some(ack_value) = self.flow.on_consumed(bytes) {
            trace!(node = %self.node, ack_value, "buffer ack");
            self.send(dcp_protocol::buffer_ack(ack_value)).await?;
        }
        Ok(())
    }

    fn check_stall(&mut self, noop_interval: Duration) {
        if !self.stall_reported && self.flow.is_stalled(noop_interval) {
            self.stall_reported = true;
            self.listener().on_failure(DcpError::Fatal(format!(
                "flow control stalled on {}: {} bytes unacknowledged",
                self.node,
                self.flow.outstanding()
            )));
        }
    }

    // -- frame dispatch -----------------------------------------------------

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), DcpError> {
        if frame.is_server_request() {
            // Topology pushes must land in the arbiter before any later
            // frame on this channel is acted on; handling them inline on
            // the I/O task guarantees that ordering.
            return service_server_request(&mut self.framed, &self.shared.arbiter, &frame)
                .await;
        }
        if frame.magic == magic::REQUEST {
            return self.handle_server_initiated(frame).await;
        }
        if frame.is_response() {
            return self.handle_response(frame).await;
        }
        Err(DcpError::ProtocolViolation(format!(
            "unexpected magic 0x{:02x}",
            frame.magic
        )))
    }

    /// Server-initiated traffic on the request magic: DCP events and NOOP.
    async fn handle_server_initiated(&mut self, frame: Frame) -> Result<(), DcpError> {
        if frame.opcode == opcode::DCP_NOOP {
            let reply = dcp_protocol::noop_reply(frame.opaque);
            return self.send(reply).await;
        }
        let wire_len = frame.wire_len() as u32;
        if !self.streams.contains_key(&frame.opaque) {
            // Late frame racing a close; drain it without delivery.
            debug!(
                opcode = frame.opcode,
                opaque = frame.opaque,
                "event for unknown stream, drained"
            );
            self.flow.on_frame(wire_len);
            return self.credit(wire_len).await;
        }
        self.flow.on_frame(wire_len);
        let action = self
            .streams
            .get_mut(&frame.opaque)
            .expect("checked above")
            .handle_event(&frame);
        match action {
            EventAction::Deliver(event, update) => {
                // System events outside the configured collections filter
                // still advance the offset but are not surfaced.
                if let ChangeEvent::SystemEvent(system_event) = &event {
                    let name = String::from_utf8_lossy(&system_event.key);
                    if !self.shared.config.collections_filter.matches(&name) {
                        return self.consume(frame.vbucket(), update, wire_len).await;
                    }
                }
                self.deliver(event, update, wire_len).await
            }
            EventAction::Consume(update) => self.consume(frame.vbucket(), update, wire_len).await,
            EventAction::End(reason) => {
                self.finish_stream(frame.opaque, frame.vbucket(), reason, wire_len)
                    .await
            }
            EventAction::Violation(detail) => Err(DcpError::ProtocolViolation(detail)),
        }
    }

    async fn finish_stream(
        &mut self,
        opaque: u32,
        vbucket: u16,
        reason: StreamEndReason,
        wire_len: u32,
    ) -> Result<(), DcpError> {
        if wire_len > 0 {
            self.credit(wire_len).await?;
        }
        self.streams.remove(&opaque);
        self.by_vbucket.remove(&vbucket);
        // A migrating or server-ended stream discards withheld events; an
        // OK end keeps them buffered until persistence catches up.
        if reason != StreamEndReason::Ok
            && let Some(buffer) = &mut self.mitigation
        {
            buffer.clear(vbucket);
        }
        info!(node = %self.node, vbucket, ?reason, "stream ended");
        self.listener().on_stream_end(vbucket, reason);
        let _ = self.events.send(ChannelEvent::StreamEnded {
            node: self.node,
            vbucket,
            reason,
        });
        Ok(())
    }

    /// Deliver one event to the listener, honoring mitigation and the
    /// flow-control mode.  The checkpoint update is applied at delivery so
    /// session state never gets ahead of what the host has observed.
    async fn deliver(
        &mut self,
        event: ChangeEvent,
        update: Option<SessionUpdate>,
        wire_len: u32,
    ) -> Result<(), DcpError> {
        let vbucket = event_vbucket(&event);
        if self.mitigation.is_some() {
            // Gate key: the update's seqno (window start for markers);
            // gate-less entries release when they reach the front.
            let gate = update
                .map(SessionUpdate::gate)
                .or_else(|| event.by_seqno())
                .unwrap_or(0);
            self.mitigation
                .as_mut()
                .expect("checked above")
                .push(vbucket, gate, (Some(event), update, wire_len));
            return self.drain_mitigated(vbucket).await;
        }
        if let Some(update) = update {
            update.apply(&self.shared.session, vbucket);
        }
        self.dispatch(event, wire_len).await
    }

    /// Apply a checkpoint update and return credit without delivery.
    async fn consume(
        &mut self,
        vbucket: u16,
        update: Option<SessionUpdate>,
        wire_len: u32,
    ) -> Result<(), DcpError> {
        if self.mitigation.is_some()
            && let Some(update) = update
        {
            self.mitigation
                .as_mut()
                .expect("checked above")
                .push(vbucket, update.gate(), (None, Some(update), wire_len));
            return self.drain_mitigated(vbucket).await;
        }
        if let Some(update) = update {
            update.apply(&self.shared.session, vbucket);
        }
        self.credit(wire_len).await
    }

    async fn drain_mitigated(&mut self, vbucket: u16) -> Result<(), DcpError> {
        let released = match &mut self.mitigation {
            Some(buffer) => buffer.drain_released(vbucket, &self.persisted),
            None => Vec::new(),
        };
        for (_gate, (event, update, wire_len)) in released {
            if let Some(update) = update {
                update.apply(&self.shared.session, vbucket);
            }
            match event {
                Some(event) => self.dispatch(event, wire_len).await?,
                None => self.credit(wire_len).await?,
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, event: ChangeEvent, wire_len: u32) -> Result<(), DcpError> {
        let mode = self.shared.config.flow_control_mode;
        let listener = self.listener();
        match mode {
            FlowControlMode::Auto => {
                self.credit(wire_len).await?;
                dispatch_to_listener(&*listener, event, AckHandle::pre_acked(wire_len));
                Ok(())
            }
            FlowControlMode::AutoAfterCallback => {
                dispatch_to_listener(&*listener, event, AckHandle::pre_acked(wire_len));
                self.credit(wire_len).await
            }
            FlowControlMode::Manual => {
                let handle = AckHandle::new(wire_len, self.ack_tx.clone());
                dispatch_to_listener(&*listener, event, handle);
                Ok(())
            }
        }
    }

    // -- responses ----------------------------------------------------------

    async fn handle_response(&mut self, frame: Frame) -> Result<(), DcpError> {
        if let Some(phase) = self.streams.get(&frame.opaque).map(VbucketStream::phase) {
            if frame.opcode == opcode::DCP_STREAM_REQ
                && matches!(phase, StreamPhase::Opening | StreamPhase::RollingBack)
            {
                return self.handle_open_response(frame).await;
            }
            debug!(
                opcode = frame.opcode,
                opaque = frame.opaque,
                "unexpected response on stream opaque, dropped"
            );
            return Ok(());
        }
        let Some(pending) = self.pending.remove(&frame.opaque) else {
            debug!(
                opcode = frame.opcode,
                opaque = frame.opaque,
                "response for unknown opaque, dropped"
            );
            return Ok(());
        };
        match pending {
            Pending::Noop => Ok(()),
            Pending::ClusterConfig => {
                if frame.status() == status::SUCCESS
                    && let Err(error) = self.shared.arbiter.offer_raw(&frame.value)
                {
                    warn!(%error, "ignoring unparseable cluster config");
                }
                Ok(())
            }
            Pending::CloseStream { vbucket } => {
                // With send_stream_end negotiated the server follows up with
                // a STREAM_END(CLOSED); otherwise this response is the end.
                if !self
                    .shared
                    .config
                    .control
                    .send_stream_end_on_client_close_stream
                    && let Some(&opaque) = self.by_vbucket.get(&vbucket)
                {
                    return self
                        .finish_stream(opaque, vbucket, StreamEndReason::Closed, 0)
                        .await;
                }
                Ok(())
            }
            Pending::ObserveSeqno => {
                if frame.status() == status::SUCCESS
                    && let Ok(observed) = ObserveSeqnoResponse::parse(&frame)
                {
                    self.record_persisted(observed);
                    return self.drain_mitigated(observed.vbucket).await;
                }
                Ok(())
            }
            Pending::FailoverLog {
                vbucket,
                from_now,
                end,
            } => {
                if frame.status() != status::SUCCESS {
                    let _ = self.events.send(ChannelEvent::StreamFailed {
                        node: self.node,
                        vbucket,
                        status: frame.status(),
                    });
                    return Ok(());
                }
                let entries = parse_failover_log(&frame.value)
                    .map_err(|e| DcpError::ProtocolViolation(e.to_string()))?;
                let vbuuid = self.shared.session.update(vbucket, |state| {
                    state.apply_failover_log(&entries);
                    state.vbuuid
                });
                let opaque = self.next_opaque();
                self.pending.insert(
                    opaque,
                    Pending::NowCapture {
                        vbucket,
                        from_now,
                        end,
                    },
                );
                self.send(dcp_protocol::observe_seqno(vbucket, vbuuid, opaque))
                    .await
            }
            Pending::NowCapture {
                vbucket,
                from_now,
                end,
            } => {
                if frame.status() != status::SUCCESS {
                    let _ = self.events.send(ChannelEvent::StreamFailed {
                        node: self.node,
                        vbucket,
                        status: frame.status(),
                    });
                    return Ok(());
                }
                let observed = ObserveSeqnoResponse::parse(&frame)
                    .map_err(|e| DcpError::ProtocolViolation(e.to_string()))?;
                if from_now {
                    self.shared.session.update(vbucket, |state| {
                        state.seqno = observed.current_seqno;
                        state.set_snapshot(observed.current_seqno, observed.current_seqno);
                    });
                }
                let end_seqno = match end {
                    EndSpec::Now => observed.current_seqno,
                    EndSpec::Infinity => END_SEQNO_INFINITY,
                    EndSpec::Seqno(s) => s,
                };
                self.open_stream(vbucket, end_seqno).await
            }
        }
    }

    fn record_persisted(&mut self, observed: ObserveSeqnoResponse) {
        self.persisted
            .record(observed.vbucket, observed.persisted_seqno);
    }

    async fn handle_open_response(&mut self, frame: Frame) -> Result<(), DcpError> {
        let listener = self.listener();
        let outcome = {
            let stream = self
                .streams
                .get_mut(&frame.opaque)
                .expect("checked by caller");
            let vbucket = stream.vbucket();
            stream.handle_open_response(&frame, &self.shared.session, |seqno| {
                listener.on_rollback(vbucket, seqno) == RollbackAction::Veto
            })
        };
        let vbucket = self
            .streams
            .get(&frame.opaque)
            .map_or_else(|| frame.vbucket(), VbucketStream::vbucket);
        match outcome {
            OpenOutcome::Opened { .. } => {
                let state = self.shared.session.get(vbucket);
                let log: Vec<dcp_protocol::FailoverLogEntry> = state
                    .failover_log
                    .iter()
                    .map(|&(vbuuid, seqno)| dcp_protocol::FailoverLogEntry { vbuuid, seqno })
                    .collect();
                listener.on_failover_log(vbucket, &log);
                let end_seqno = self
                    .streams
                    .get(&frame.opaque)
                    .map_or(END_SEQNO_INFINITY, VbucketStream::end_seqno);
                let _ = self.events.send(ChannelEvent::StreamOpened {
                    node: self.node,
                    vbucket,
                    end_seqno,
                });
                Ok(())
            }
            OpenOutcome::Retry { request } => {
                if let Some(stream) = self.streams.get_mut(&frame.opaque) {
                    stream.mark_retrying();
                }
                let retry = dcp_protocol::stream_request(vbucket, frame.opaque, &request);
                self.send(retry).await
            }
            OpenOutcome::Vetoed { rollback_seqno } => {
                self.streams.remove(&frame.opaque);
                self.by_vbucket.remove(&vbucket);
                listener.on_failure(DcpError::Fatal(format!(
                    "rollback to {rollback_seqno} vetoed on vbucket {vbucket}"
                )));
                Ok(())
            }
            OpenOutcome::Failed { status } => {
                self.streams.remove(&frame.opaque);
                self.by_vbucket.remove(&vbucket);
                let _ = self.events.send(ChannelEvent::StreamFailed {
                    node: self.node,
                    vbucket,
                    status,
                });
                Ok(())
            }
        }
    }

    // -- mitigation polling -------------------------------------------------

    async fn mitigation_poll(&mut self) -> Result<(), DcpError> {
        // Poll every vbucket with an open stream or a non-empty buffer.
        let mut vbuckets: Vec<u16> = self.by_vbucket.keys().copied().collect();
        if let Some(buffer) = &self.mitigation {
            for vb in 0..self.shared.session.num_partitions() {
                if buffer.buffered(vb) > 0 && !vbuckets.contains(&vb) {
                    vbuckets.push(vb);
                }
            }
        }
        for vbucket in vbuckets {
            let vbuuid = self.shared.session.get(vbucket).vbuuid;
            let opaque = self.next_opaque();
            self.pending.insert(opaque, Pending::ObserveSeqno);
            self.send(dcp_protocol::observe_seqno(vbucket, vbuuid, opaque))
                .await?;
        }
        Ok(())
    }
}

fn event_vbucket(event: &ChangeEvent) -> u16 {
    match event {
        ChangeEvent::Mutation(m) => m.vbucket,
        ChangeEvent::Deletion(d) => d.vbucket,
        ChangeEvent::Expiration(e) => e.vbucket,
        ChangeEvent::Snapshot(s) => s.vbucket,
        ChangeEvent::SystemEvent(s) => s.vbucket,
        ChangeEvent::OsoSnapshot(o) => o.vbucket,
        ChangeEvent::SeqnoAdvanced(a) => a.vbucket,
    }
}

fn dispatch_to_listener(
    listener: &dyn DatabaseChangeListener,
    event: ChangeEvent,
    ack: AckHandle,
) {
    match event {
        ChangeEvent::Mutation(mutation) => listener.on_mutation(mutation, ack),
        ChangeEvent::Deletion(deletion) => listener.on_deletion(deletion, ack),
        ChangeEvent::Expiration(expiration) => listener.on_expiration(expiration, ack),
        ChangeEvent::Snapshot(marker) => listener.on_snapshot(marker, ack),
        ChangeEvent::SystemEvent(event) => listener.on_system_event(event, ack),
        ChangeEvent::OsoSnapshot(oso) => listener.on_oso_snapshot(oso, ack),
        ChangeEvent::SeqnoAdvanced(advance) => {
            // The hook takes no ack handle; credit is returned on its
            // behalf, so manual mode cannot strand these bytes.
            listener.on_seqno_advanced(advance);
            ack.ack();
        }
    }
}
