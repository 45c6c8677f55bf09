// mock_server: a scriptable DCP producer speaking the binary protocol.
//
// Binds to port 0 (random) and exposes the actual bound address; each test
// spins up its own isolated instance.  Handles the full client handshake
// (SASL PLAIN, HELLO echo, SELECT_BUCKET, DCP_OPEN, DCP_CONTROL), serves
// cluster configs, failover logs, and OBSERVE_SEQNO, and streams scripted
// per-vbucket mutations with snapshot markers and STREAM_END frames.
//
// Test hooks: pause/resume persistence (rollback-mitigation scenarios),
// restart with or without discarding unpersisted writes, and a map that
// starts empty (bucket warm-up).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::codec::Framed;
use tracing::debug;

use dcp_protocol::{
    FailoverLogEntry, Frame, FrameCodec, Mutation, ObserveSeqnoResponse, SnapshotMarker,
    StreamEndMessage, encode_failover_log, magic, opcode, parse_stream_request,
    snapshot_flags, status,
};

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub partitions: u16,
    /// Serve a config with an empty vbucket map until `publish_map` is
    /// called (the just-created-bucket case).
    pub start_with_empty_map: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            partitions: 1024,
            start_with_empty_map: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Item {
    vbucket: u16,
    seqno: u64,
    key: String,
    value: Bytes,
}

#[derive(Debug)]
struct VbState {
    vbuuid: u64,
    high: u64,
    persisted: u64,
    items: Vec<Item>,
    /// Newest first.
    failover: Vec<FailoverLogEntry>,
}

impl VbState {
    fn new(vbucket: u16) -> Self {
        let vbuuid = 0x1000 + u64::from(vbucket);
        VbState {
            vbuuid,
            high: 0,
            persisted: 0,
            items: Vec::new(),
            failover: vec![FailoverLogEntry { vbuuid, seqno: 0 }],
        }
    }
}

struct ServerState {
    partitions: u16,
    map_ready: AtomicBool,
    rev: AtomicU64,
    addr: OnceLock<SocketAddr>,
    vbuckets: Vec<Mutex<VbState>>,
    persistence: AtomicBool,
    new_items: broadcast::Sender<Item>,
    /// DCP_CONTROL keys in arrival order, for handshake assertions.
    control_keys: Mutex<Vec<String>>,
    /// Total bytes acknowledged via DCP_BUFFER_ACK.
    acked_bytes: AtomicU64,
    /// Shutdown handles for live connections.
    connections: Mutex<Vec<watch::Sender<bool>>>,
}

/// A mock DCP server for integration testing.
pub struct MockDcpServer {
    state: Arc<ServerState>,
    _accept: tokio::task::JoinHandle<()>,
}

impl MockDcpServer {
    pub async fn start(partitions: u16) -> std::io::Result<Self> {
        Self::start_with(ServerOptions {
            partitions,
            ..ServerOptions::default()
        })
        .await
    }

    pub async fn start_with(options: ServerOptions) -> std::io::Result<Self> {
        let (new_items, _) = broadcast::channel(65536);
        let state = Arc::new(ServerState {
            partitions: options.partitions,
            map_ready: AtomicBool::new(!options.start_with_empty_map),
            rev: AtomicU64::new(1),
            addr: OnceLock::new(),
            vbuckets: (0..options.partitions)
                .map(|vb| Mutex::new(VbState::new(vb)))
                .collect(),
            persistence: AtomicBool::new(true),
            new_items,
            control_keys: Mutex::new(Vec::new()),
            acked_bytes: AtomicU64::new(0),
            connections: Mutex::new(Vec::new()),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        state
            .addr
            .set(listener.local_addr()?)
            .expect("addr set once");

        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(?peer, "mock server accepted connection");
                        let (shutdown_tx, shutdown_rx) = watch::channel(false);
                        accept_state
                            .connections
                            .lock()
                            .unwrap()
                            .push(shutdown_tx);
                        let state = accept_state.clone();
                        tokio::spawn(handle_connection(stream, state, shutdown_rx));
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(MockDcpServer {
            state,
            _accept: accept,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        *self.state.addr.get().expect("server started")
    }

    pub fn partitions(&self) -> u16 {
        self.state.partitions
    }

    // -- test hooks ---------------------------------------------------------

    /// Append one document to `vbucket`; returns its seqno.
    pub fn write(&self, vbucket: u16, key: &str, value: &[u8]) -> u64 {
        let item = {
            let mut vb = self.state.vbuckets[vbucket as usize].lock().unwrap();
            vb.high += 1;
            if self.state.persistence.load(Ordering::SeqCst) {
                vb.persisted = vb.high;
            }
            let item = Item {
                vbucket,
                seqno: vb.high,
                key: key.to_owned(),
                value: Bytes::copy_from_slice(value),
            };
            vb.items.push(item.clone());
            item
        };
        let seqno = item.seqno;
        let _ = self.state.new_items.send(item);
        seqno
    }

    /// One document per vbucket, keys `"{prefix}-{vbucket}"`.
    pub fn write_one_per_vbucket(&self, prefix: &str) {
        for vb in 0..self.state.partitions {
            self.write(vb, &format!("{prefix}-{vb}"), b"{}");
        }
    }

    /// `count` documents distributed round-robin over all vbuckets.
    pub fn write_docs(&self, count: usize, prefix: &str) {
        for i in 0..count {
            let vb = (i % self.state.partitions as usize) as u16;
            self.write(vb, &format!("{prefix}-{i}"), b"{}");
        }
    }

    /// Pause or resume persistence.  Resuming marks everything written so
    /// far as persisted.
    pub fn set_persistence(&self, enabled: bool) {
        self.state.persistence.store(enabled, Ordering::SeqCst);
        if enabled {
            for lock in &self.state.vbuckets {
                let mut vb = lock.lock().unwrap();
                vb.persisted = vb.high;
            }
        }
    }

    /// Drop every connection, as a data-service restart would.  With
    /// `discard_unpersisted`, writes beyond the persisted seqno are lost and
    /// each vbucket gets a new generation (uuid) at the persisted boundary.
    pub fn restart(&self, discard_unpersisted: bool) {
        for shutdown in self.state.connections.lock().unwrap().drain(..) {
            let _ = shutdown.send(true);
        }
        if discard_unpersisted {
            for lock in &self.state.vbuckets {
                let mut vb = lock.lock().unwrap();
                if vb.high > vb.persisted {
                    let boundary = vb.persisted;
                    vb.items.retain(|item| item.seqno <= boundary);
                    vb.high = boundary;
                    vb.vbuuid += 1;
                    let entry = FailoverLogEntry {
                        vbuuid: vb.vbuuid,
                        seqno: boundary,
                    };
                    vb.failover.insert(0, entry);
                }
            }
        }
    }

    /// Publish a ready vbucket map (pairs with `start_with_empty_map`).
    pub fn publish_map(&self) {
        self.state.rev.fetch_add(1, Ordering::SeqCst);
        self.state.map_ready.store(true, Ordering::SeqCst);
    }

    /// DCP_CONTROL keys received so far, in order.
    pub fn control_keys(&self) -> Vec<String> {
        self.state.control_keys.lock().unwrap().clone()
    }

    /// Total bytes acknowledged by clients via DCP_BUFFER_ACK.
    pub fn acked_bytes(&self) -> u64 {
        self.state.acked_bytes.load(Ordering::SeqCst)
    }

    pub fn high_seqno(&self, vbucket: u16) -> u64 {
        self.state.vbuckets[vbucket as usize].lock().unwrap().high
    }
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

fn response_for(request: &Frame, status_code: u16) -> Frame {
    let mut frame = Frame::request(request.opcode);
    frame.magic = magic::RESPONSE;
    frame.vbucket_or_status = status_code;
    frame.opaque = request.opaque;
    frame
}

fn config_json(state: &ServerState) -> Vec<u8> {
    let rev = state.rev.load(Ordering::SeqCst);
    let vbucket_map: Vec<Vec<i32>> = if state.map_ready.load(Ordering::SeqCst) {
        (0..state.partitions).map(|_| vec![0]).collect()
    } else {
        Vec::new()
    };
    let addr = state.addr.get().expect("server started");
    serde_json::json!({
        "rev": rev,
        "revEpoch": 1,
        "vBucketServerMap": {
            "serverList": [addr.to_string()],
            "vBucketMap": vbucket_map,
        },
    })
    .to_string()
    .into_bytes()
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let framed = Framed::new(stream, FrameCodec);
    let (mut sink, mut frames) = framed.split();

    // All writes are funneled through one queue so stream tasks and the
    // request handler never interleave partial frames.
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut send_end_on_close = false;
    let mut open_streams: HashMap<u16, (u32, tokio::task::JoinHandle<()>)> = HashMap::new();

    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            frame = frames.next() => match frame {
                Some(Ok(frame)) => frame,
                _ => break,
            },
        };

        if frame.magic != magic::REQUEST {
            // Client responses (e.g. to our NOOPs); nothing to do.
            continue;
        }

        match frame.opcode {
            opcode::SASL_AUTH
            | opcode::SELECT_BUCKET
            | opcode::DCP_OPEN => {
                let _ = tx.send(response_for(&frame, status::SUCCESS));
            }
            opcode::HELLO => {
                // Honor everything requested.
                let mut response = response_for(&frame, status::SUCCESS);
                response.value = frame.value.clone();
                let _ = tx.send(response);
            }
            opcode::DCP_CONTROL => {
                let key = String::from_utf8_lossy(&frame.key).into_owned();
                if key == "send_stream_end_on_client_close_stream" {
                    send_end_on_close = true;
                }
                state.control_keys.lock().unwrap().push(key);
                let _ = tx.send(response_for(&frame, status::SUCCESS));
            }
            opcode::GET_CLUSTER_CONFIG => {
                let mut response = response_for(&frame, status::SUCCESS);
                response.value = config_json(&state).into();
                let _ = tx.send(response);
            }
            opcode::DCP_GET_FAILOVER_LOG => {
                let vb = state.vbuckets[frame.vbucket() as usize].lock().unwrap();
                let mut response = response_for(&frame, status::SUCCESS);
                response.value = encode_failover_log(&vb.failover);
                let _ = tx.send(response);
            }
            opcode::OBSERVE_SEQNO => {
                let vb = state.vbuckets[frame.vbucket() as usize].lock().unwrap();
                let body = ObserveSeqnoResponse {
                    vbucket: frame.vbucket(),
                    vbuuid: vb.vbuuid,
                    persisted_seqno: vb.persisted,
                    current_seqno: vb.high,
                };
                let _ = tx.send(body.to_frame(frame.opaque));
            }
            opcode::DCP_BUFFER_ACK => {
                if frame.extras.len() >= 4 {
                    let acked = u32::from_be_bytes([
                        frame.extras[0],
                        frame.extras[1],
                        frame.extras[2],
                        frame.extras[3],
                    ]);
                    state
                        .acked_bytes
                        .fetch_add(u64::from(acked), Ordering::SeqCst);
                }
            }
            opcode::DCP_STREAM_REQ => {
                handle_stream_request(&state, &tx, &frame, &mut open_streams);
            }
            opcode::DCP_CLOSE_STREAM => {
                let vbucket = frame.vbucket();
                let _ = tx.send(response_for(&frame, status::SUCCESS));
                if let Some((stream_opaque, task)) = open_streams.remove(&vbucket) {
                    task.abort();
                    if send_end_on_close {
                        let _ = tx.send(StreamEndMessage::to_frame(vbucket, stream_opaque, 1));
                    }
                }
            }
            opcode::DCP_NOOP => {
                let _ = tx.send(response_for(&frame, status::SUCCESS));
            }
            _ => {
                let _ = tx.send(response_for(&frame, status::UNKNOWN_COMMAND));
            }
        }
    }

    for (_, (_, task)) in open_streams {
        task.abort();
    }
    drop(tx);
    let _ = writer.await;
}

fn handle_stream_request(
    state: &Arc<ServerState>,
    tx: &mpsc::UnboundedSender<Frame>,
    frame: &Frame,
    open_streams: &mut HashMap<u16, (u32, tokio::task::JoinHandle<()>)>,
) {
    let vbucket = frame.vbucket();
    let Ok(params) = parse_stream_request(frame) else {
        let _ = tx.send(response_for(frame, status::ERANGE));
        return;
    };

    let failover = {
        let vb = state.vbuckets[vbucket as usize].lock().unwrap();
        if params.start_seqno > vb.high {
            // The client claims history this generation never produced.
            let mut response = response_for(frame, status::ROLLBACK);
            let mut body = bytes::BytesMut::with_capacity(8);
            bytes::BufMut::put_u64(&mut body, vb.high);
            response.value = body.freeze();
            let _ = tx.send(response);
            return;
        }
        vb.failover.clone()
    };

    let mut response = response_for(frame, status::SUCCESS);
    response.value = encode_failover_log(&failover);
    let _ = tx.send(response);

    let task = tokio::spawn(run_stream(
        state.clone(),
        tx.clone(),
        vbucket,
        frame.opaque,
        params.start_seqno,
        params.end_seqno,
    ));
    open_streams.insert(vbucket, (frame.opaque, task));
}

/// Stream backlog then live items for one vbucket until `end` is reached.
async fn run_stream(
    state: Arc<ServerState>,
    tx: mpsc::UnboundedSender<Frame>,
    vbucket: u16,
    opaque: u32,
    start: u64,
    end: u64,
) {
    // Subscribe before reading the backlog so nothing written in between is
    // missed; duplicates are filtered by seqno below.
    let mut live = state.new_items.subscribe();

    let backlog: Vec<Item> = {
        let vb = state.vbuckets[vbucket as usize].lock().unwrap();
        vb.items
            .iter()
            .filter(|item| item.seqno > start && item.seqno <= end)
            .cloned()
            .collect()
    };

    let mut sent = start;
    if let (Some(first), Some(last)) = (backlog.first(), backlog.last()) {
        let marker = SnapshotMarker {
            vbucket,
            start_seqno: first.seqno,
            end_seqno: last.seqno,
            flags: snapshot_flags::DISK,
        };
        if tx.send(marker.to_frame(opaque)).is_err() {
            return;
        }
        for item in &backlog {
            if tx.send(mutation_frame(item, opaque)).is_err() {
                return;
            }
            sent = item.seqno;
        }
    }

    if sent >= end {
        let _ = tx.send(StreamEndMessage::to_frame(vbucket, opaque, 0));
        return;
    }

    loop {
        let item = match live.recv().await {
            Ok(item) => item,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if item.vbucket != vbucket || item.seqno <= sent || item.seqno > end {
            continue;
        }
        let marker = SnapshotMarker {
            vbucket,
            start_seqno: item.seqno,
            end_seqno: item.seqno,
            flags: snapshot_flags::MEMORY,
        };
        if tx.send(marker.to_frame(opaque)).is_err() {
            return;
        }
        if tx.send(mutation_frame(&item, opaque)).is_err() {
            return;
        }
        sent = item.seqno;
        if sent >= end {
            let _ = tx.send(StreamEndMessage::to_frame(vbucket, opaque, 0));
            return;
        }
    }
}

fn mutation_frame(item: &Item, opaque: u32) -> Frame {
    Mutation {
        vbucket: item.vbucket,
        by_seqno: item.seqno,
        rev_seqno: 1,
        flags: 0,
        expiration: 0,
        lock_time: 0,
        cas: item.seqno,
        data_type: 0,
        key: Bytes::copy_from_slice(item.key.as_bytes()),
        value: item.value.clone(),
    }
    .to_frame(opaque)
}
