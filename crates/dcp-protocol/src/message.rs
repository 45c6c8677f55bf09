//! Typed request builders and response/event parsers.
//!
//! Builders return ready-to-encode [`Frame`]s; parsers borrow a received
//! frame and lift it into a typed message.  Parsers validate section
//! lengths and return [`CodecError::Truncated`] on short bodies -- a short
//! body on a known opcode is a protocol violation, not a recoverable skip.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::CodecError;
use crate::frame::{Frame, magic};
use crate::opcode_tables::{StreamEndReason, opcode, status};

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// One entry of a vbucket failover log, newest first on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverLogEntry {
    pub vbuuid: u64,
    pub seqno: u64,
}

/// Parameters of a DCP_STREAM_REQ, drawn from session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequestParams {
    pub vbuuid: u64,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub snapshot_start: u64,
    pub snapshot_end: u64,
}

/// `end_seqno` value meaning "stream forever".
pub const END_SEQNO_INFINITY: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Request builders
// ---------------------------------------------------------------------------

/// HELLO: key = client identifier, value = requested features as u16s.
pub fn hello_request(client_name: &str, features: &[u16]) -> Frame {
    let mut value = BytesMut::with_capacity(features.len() * 2);
    for f in features {
        value.put_u16(*f);
    }
    let mut frame = Frame::request(opcode::HELLO);
    frame.key = Bytes::copy_from_slice(client_name.as_bytes());
    frame.value = value.freeze();
    frame
}

/// SASL PLAIN: authzid NUL authcid NUL passwd.
pub fn sasl_auth_plain(username: &str, password: &str) -> Frame {
    let mut value = BytesMut::with_capacity(username.len() + password.len() + 2);
    value.put_u8(0);
    value.put_slice(username.as_bytes());
    value.put_u8(0);
    value.put_slice(password.as_bytes());
    let mut frame = Frame::request(opcode::SASL_AUTH);
    frame.key = Bytes::from_static(b"PLAIN");
    frame.value = value.freeze();
    frame
}

pub fn select_bucket(bucket: &str) -> Frame {
    let mut frame = Frame::request(opcode::SELECT_BUCKET);
    frame.key = Bytes::copy_from_slice(bucket.as_bytes());
    frame
}

/// DCP_OPEN: extras = legacy seqno (0) + flags; key = connection name.
pub fn open_connection(connection_name: &str, flags: u32) -> Frame {
    let mut extras = BytesMut::with_capacity(8);
    extras.put_u32(0);
    extras.put_u32(flags);
    let mut frame = Frame::request(opcode::DCP_OPEN);
    frame.extras = extras.freeze();
    frame.key = Bytes::copy_from_slice(connection_name.as_bytes());
    frame
}

/// DCP_CONTROL: key/value string pair.
pub fn control(key: &str, value: &str) -> Frame {
    let mut frame = Frame::request(opcode::DCP_CONTROL);
    frame.key = Bytes::copy_from_slice(key.as_bytes());
    frame.value = Bytes::copy_from_slice(value.as_bytes());
    frame
}

/// DCP_STREAM_REQ: extras = flags, reserved, start, end, vbuuid,
/// snapshot start, snapshot end.
pub fn stream_request(vbucket: u16, opaque: u32, params: &StreamRequestParams) -> Frame {
    let mut extras = BytesMut::with_capacity(48);
    extras.put_u32(0); // flags
    extras.put_u32(0); // reserved
    extras.put_u64(params.start_seqno);
    extras.put_u64(params.end_seqno);
    extras.put_u64(params.vbuuid);
    extras.put_u64(params.snapshot_start);
    extras.put_u64(params.snapshot_end);
    let mut frame = Frame::request(opcode::DCP_STREAM_REQ);
    frame.vbucket_or_status = vbucket;
    frame.opaque = opaque;
    frame.extras = extras.freeze();
    frame
}

/// DCP_CLOSE_STREAM for the stream identified by `opaque`.
pub fn close_stream(vbucket: u16, opaque: u32) -> Frame {
    let mut frame = Frame::request(opcode::DCP_CLOSE_STREAM);
    frame.vbucket_or_status = vbucket;
    frame.opaque = opaque;
    frame
}

/// DCP_BUFFER_ACK carrying bytes consumed since the last ack.
pub fn buffer_ack(ack_bytes: u32) -> Frame {
    let mut extras = BytesMut::with_capacity(4);
    extras.put_u32(ack_bytes);
    let mut frame = Frame::request(opcode::DCP_BUFFER_ACK);
    frame.extras = extras.freeze();
    frame
}

/// Response to a server DCP_NOOP, echoing its opaque.
pub fn noop_reply(opaque: u32) -> Frame {
    let mut frame = Frame::request(opcode::DCP_NOOP);
    frame.magic = magic::RESPONSE;
    frame.opaque = opaque;
    frame
}

/// OBSERVE_SEQNO: value = the vbuuid whose persistence state is queried.
pub fn observe_seqno(vbucket: u16, vbuuid: u64, opaque: u32) -> Frame {
    let mut value = BytesMut::with_capacity(8);
    value.put_u64(vbuuid);
    let mut frame = Frame::request(opcode::OBSERVE_SEQNO);
    frame.vbucket_or_status = vbucket;
    frame.opaque = opaque;
    frame.value = value.freeze();
    frame
}

pub fn get_failover_log(vbucket: u16, opaque: u32) -> Frame {
    let mut frame = Frame::request(opcode::DCP_GET_FAILOVER_LOG);
    frame.vbucket_or_status = vbucket;
    frame.opaque = opaque;
    frame
}

pub fn get_cluster_config(opaque: u32) -> Frame {
    let mut frame = Frame::request(opcode::GET_CLUSTER_CONFIG);
    frame.opaque = opaque;
    frame
}

/// Reply to an unrecognized server-initiated request.
pub fn server_reply_not_supported(request: &Frame) -> Frame {
    Frame::server_response(request.opcode, request.opaque, status::NOT_SUPPORTED)
}

// ---------------------------------------------------------------------------
// Response parsers
// ---------------------------------------------------------------------------

/// Honored features from a HELLO response (u16 array in the value).
pub fn parse_hello_response(frame: &Frame) -> Result<Vec<u16>, CodecError> {
    if frame.value.len() % 2 != 0 {
        return Err(CodecError::Truncated("HELLO", frame.value.len()));
    }
    let mut buf = frame.value.clone();
    let mut honored = Vec::with_capacity(buf.len() / 2);
    while buf.has_remaining() {
        honored.push(buf.get_u16());
    }
    Ok(honored)
}

/// DCP_CONTROL responses carry no body; success is the status alone.
pub fn parse_control_response(frame: &Frame) -> Result<(), u16> {
    if frame.status() == status::SUCCESS {
        Ok(())
    } else {
        Err(frame.status())
    }
}

/// Failover log body: (vbuuid, seqno) u64 pairs, newest first.
pub fn parse_failover_log(body: &[u8]) -> Result<Vec<FailoverLogEntry>, CodecError> {
    if body.len() % 16 != 0 {
        return Err(CodecError::Truncated("failover log", body.len()));
    }
    let mut buf = body;
    let mut entries = Vec::with_capacity(body.len() / 16);
    while !buf.is_empty() {
        entries.push(FailoverLogEntry {
            vbuuid: buf.get_u64(),
            seqno: buf.get_u64(),
        });
    }
    Ok(entries)
}

/// Encode a failover log into a response body (producer side).
pub fn encode_failover_log(entries: &[FailoverLogEntry]) -> Bytes {
    let mut body = BytesMut::with_capacity(entries.len() * 16);
    for entry in entries {
        body.put_u64(entry.vbuuid);
        body.put_u64(entry.seqno);
    }
    body.freeze()
}

/// Decode a DCP_STREAM_REQ's extras (producer side).
pub fn parse_stream_request(frame: &Frame) -> Result<StreamRequestParams, CodecError> {
    if frame.extras.len() < 48 {
        return Err(CodecError::Truncated("stream request", frame.extras.len()));
    }
    let mut extras = frame.extras.clone();
    let _flags = extras.get_u32();
    let _reserved = extras.get_u32();
    Ok(StreamRequestParams {
        start_seqno: extras.get_u64(),
        end_seqno: extras.get_u64(),
        vbuuid: extras.get_u64(),
        snapshot_start: extras.get_u64(),
        snapshot_end: extras.get_u64(),
    })
}

/// Body of a ROLLBACK-status stream-request response: the seqno to rewind to.
pub fn parse_rollback_seqno(frame: &Frame) -> Result<u64, CodecError> {
    if frame.value.len() < 8 {
        return Err(CodecError::Truncated("rollback", frame.value.len()));
    }
    let mut buf = frame.value.clone();
    Ok(buf.get_u64())
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMarker {
    pub vbucket: u16,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub flags: u32,
}

impl SnapshotMarker {
    pub fn parse(frame: &Frame) -> Result<Self, CodecError> {
        if frame.extras.len() < 20 {
            return Err(CodecError::Truncated("snapshot marker", frame.extras.len()));
        }
        let mut extras = frame.extras.clone();
        Ok(SnapshotMarker {
            vbucket: frame.vbucket(),
            start_seqno: extras.get_u64(),
            end_seqno: extras.get_u64(),
            flags: extras.get_u32(),
        })
    }

    pub fn to_frame(&self, opaque: u32) -> Frame {
        let mut extras = BytesMut::with_capacity(20);
        extras.put_u64(self.start_seqno);
        extras.put_u64(self.end_seqno);
        extras.put_u32(self.flags);
        let mut frame = Frame::request(opcode::DCP_SNAPSHOT_MARKER);
        frame.vbucket_or_status = self.vbucket;
        frame.opaque = opaque;
        frame.extras = extras.freeze();
        frame
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub vbucket: u16,
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub flags: u32,
    pub expiration: u32,
    pub lock_time: u32,
    pub cas: u64,
    pub data_type: u8,
    pub key: Bytes,
    pub value: Bytes,
}

impl Mutation {
    /// Extras: by_seqno, rev_seqno, flags, expiration, lock_time, nmeta, nru.
    pub fn parse(frame: &Frame) -> Result<Self, CodecError> {
        if frame.extras.len() < 31 {
            return Err(CodecError::Truncated("mutation", frame.extras.len()));
        }
        let mut extras = frame.extras.clone();
        Ok(Mutation {
            vbucket: frame.vbucket(),
            by_seqno: extras.get_u64(),
            rev_seqno: extras.get_u64(),
            flags: extras.get_u32(),
            expiration: extras.get_u32(),
            lock_time: extras.get_u32(),
            cas: frame.cas,
            data_type: frame.data_type,
            key: frame.key.clone(),
            value: frame.value.clone(),
        })
    }

    /// Build the wire frame for this mutation (mock-server side).
    pub fn to_frame(&self, opaque: u32) -> Frame {
        let mut extras = BytesMut::with_capacity(31);
        extras.put_u64(self.by_seqno);
        extras.put_u64(self.rev_seqno);
        extras.put_u32(self.flags);
        extras.put_u32(self.expiration);
        extras.put_u32(self.lock_time);
        extras.put_u16(0); // nmeta
        extras.put_u8(0); // nru
        let mut frame = Frame::request(opcode::DCP_MUTATION);
        frame.vbucket_or_status = self.vbucket;
        frame.opaque = opaque;
        frame.cas = self.cas;
        frame.data_type = self.data_type;
        frame.extras = extras.freeze();
        frame.key = self.key.clone();
        frame.value = self.value.clone();
        frame
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    pub vbucket: u16,
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub cas: u64,
    pub key: Bytes,
}

impl Deletion {
    pub fn parse(frame: &Frame) -> Result<Self, CodecError> {
        if frame.extras.len() < 16 {
            return Err(CodecError::Truncated("deletion", frame.extras.len()));
        }
        let mut extras = frame.extras.clone();
        Ok(Deletion {
            vbucket: frame.vbucket(),
            by_seqno: extras.get_u64(),
            rev_seqno: extras.get_u64(),
            cas: frame.cas,
            key: frame.key.clone(),
        })
    }

    pub fn to_frame(&self, opaque: u32) -> Frame {
        let mut extras = BytesMut::with_capacity(18);
        extras.put_u64(self.by_seqno);
        extras.put_u64(self.rev_seqno);
        extras.put_u16(0); // nmeta
        let mut frame = Frame::request(opcode::DCP_DELETION);
        frame.vbucket_or_status = self.vbucket;
        frame.opaque = opaque;
        frame.cas = self.cas;
        frame.extras = extras.freeze();
        frame.key = self.key.clone();
        frame
    }
}

/// Expiration extras vary by negotiated version (18 bytes legacy, 20 with
/// delete-time); only the leading seqno pair is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiration {
    pub vbucket: u16,
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub key: Bytes,
}

impl Expiration {
    pub fn parse(frame: &Frame) -> Result<Self, CodecError> {
        if frame.extras.len() < 16 {
            return Err(CodecError::Truncated("expiration", frame.extras.len()));
        }
        let mut extras = frame.extras.clone();
        Ok(Expiration {
            vbucket: frame.vbucket(),
            by_seqno: extras.get_u64(),
            rev_seqno: extras.get_u64(),
            key: frame.key.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEndMessage {
    pub vbucket: u16,
    pub reason: StreamEndReason,
}

impl StreamEndMessage {
    pub fn parse(frame: &Frame) -> Result<Self, CodecError> {
        if frame.extras.len() < 4 {
            return Err(CodecError::Truncated("stream end", frame.extras.len()));
        }
        let mut extras = frame.extras.clone();
        Ok(StreamEndMessage {
            vbucket: frame.vbucket(),
            reason: StreamEndReason::from_wire(extras.get_u32()),
        })
    }

    pub fn to_frame(vbucket: u16, opaque: u32, reason_code: u32) -> Frame {
        let mut extras = BytesMut::with_capacity(4);
        extras.put_u32(reason_code);
        let mut frame = Frame::request(opcode::DCP_STREAM_END);
        frame.vbucket_or_status = vbucket;
        frame.opaque = opaque;
        frame.extras = extras.freeze();
        frame
    }
}

/// Scope/collection lifecycle event ids from the system-event extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventKind {
    CollectionCreated,
    CollectionDropped,
    CollectionFlushed,
    ScopeCreated,
    ScopeDropped,
    Unknown(u32),
}

impl SystemEventKind {
    fn from_wire(raw: u32) -> Self {
        match raw {
            0 => SystemEventKind::CollectionCreated,
            1 => SystemEventKind::CollectionDropped,
            2 => SystemEventKind::CollectionFlushed,
            3 => SystemEventKind::ScopeCreated,
            4 => SystemEventKind::ScopeDropped,
            other => SystemEventKind::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemEvent {
    pub vbucket: u16,
    pub by_seqno: u64,
    pub kind: SystemEventKind,
    pub version: u8,
    /// Scope/collection name.
    pub key: Bytes,
    /// Manifest payload (uid and ids), version-dependent.
    pub value: Bytes,
}

impl SystemEvent {
    pub fn parse(frame: &Frame) -> Result<Self, CodecError> {
        if frame.extras.len() < 13 {
            return Err(CodecError::Truncated("system event", frame.extras.len()));
        }
        let mut extras = frame.extras.clone();
        Ok(SystemEvent {
            vbucket: frame.vbucket(),
            by_seqno: extras.get_u64(),
            kind: SystemEventKind::from_wire(extras.get_u32()),
            version: extras.get_u8(),
            key: frame.key.clone(),
            value: frame.value.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqnoAdvanced {
    pub vbucket: u16,
    pub by_seqno: u64,
}

impl SeqnoAdvanced {
    pub fn parse(frame: &Frame) -> Result<Self, CodecError> {
        if frame.extras.len() < 8 {
            return Err(CodecError::Truncated("seqno advanced", frame.extras.len()));
        }
        let mut extras = frame.extras.clone();
        Ok(SeqnoAdvanced {
            vbucket: frame.vbucket(),
            by_seqno: extras.get_u64(),
        })
    }

    pub fn to_frame(vbucket: u16, opaque: u32, by_seqno: u64) -> Frame {
        let mut extras = BytesMut::with_capacity(8);
        extras.put_u64(by_seqno);
        let mut frame = Frame::request(opcode::DCP_SEQNO_ADVANCED);
        frame.vbucket_or_status = vbucket;
        frame.opaque = opaque;
        frame.extras = extras.freeze();
        frame
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsoSnapshot {
    pub vbucket: u16,
    pub flags: u32,
}

impl OsoSnapshot {
    pub fn parse(frame: &Frame) -> Result<Self, CodecError> {
        if frame.extras.len() < 4 {
            return Err(CodecError::Truncated("oso snapshot", frame.extras.len()));
        }
        let mut extras = frame.extras.clone();
        Ok(OsoSnapshot {
            vbucket: frame.vbucket(),
            flags: extras.get_u32(),
        })
    }
}

/// OBSERVE_SEQNO response body.
///
/// Format 0 is the steady state; format 1 appends failover data after a
/// vbuuid change, of which only the leading fields are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveSeqnoResponse {
    pub vbucket: u16,
    pub vbuuid: u64,
    pub persisted_seqno: u64,
    pub current_seqno: u64,
}

impl ObserveSeqnoResponse {
    pub fn parse(frame: &Frame) -> Result<Self, CodecError> {
        if frame.value.len() < 27 {
            return Err(CodecError::Truncated("observe seqno", frame.value.len()));
        }
        let mut buf = frame.value.clone();
        let _format = buf.get_u8();
        Ok(ObserveSeqnoResponse {
            vbucket: buf.get_u16(),
            vbuuid: buf.get_u64(),
            persisted_seqno: buf.get_u64(),
            current_seqno: buf.get_u64(),
        })
    }

    pub fn to_frame(&self, opaque: u32) -> Frame {
        let mut value = BytesMut::with_capacity(27);
        value.put_u8(0);
        value.put_u16(self.vbucket);
        value.put_u64(self.vbuuid);
        value.put_u64(self.persisted_seqno);
        value.put_u64(self.current_seqno);
        let mut frame = Frame::request(opcode::OBSERVE_SEQNO);
        frame.magic = magic::RESPONSE;
        frame.opaque = opaque;
        frame.value = value.freeze();
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode_tables::snapshot_flags;

    #[test]
    fn stream_request_extras_are_48_bytes_in_field_order() {
        let params = StreamRequestParams {
            vbuuid: 0x1111_2222_3333_4444,
            start_seqno: 100,
            end_seqno: END_SEQNO_INFINITY,
            snapshot_start: 90,
            snapshot_end: 110,
        };
        let frame = stream_request(7, 42, &params);
        assert_eq!(frame.extras.len(), 48);
        assert_eq!(frame.vbucket(), 7);
        assert_eq!(frame.opaque, 42);

        let mut extras = frame.extras.clone();
        assert_eq!(extras.get_u32(), 0);
        assert_eq!(extras.get_u32(), 0);
        assert_eq!(extras.get_u64(), 100);
        assert_eq!(extras.get_u64(), END_SEQNO_INFINITY);
        assert_eq!(extras.get_u64(), params.vbuuid);
        assert_eq!(extras.get_u64(), 90);
        assert_eq!(extras.get_u64(), 110);
    }

    #[test]
    fn stream_request_round_trip() {
        let params = StreamRequestParams {
            vbuuid: 9,
            start_seqno: 5,
            end_seqno: 50,
            snapshot_start: 4,
            snapshot_end: 6,
        };
        let parsed = parse_stream_request(&stream_request(3, 8, &params)).unwrap();
        assert_eq!(parsed, params);
    }

    #[test]
    fn failover_log_encode_decode() {
        let entries = vec![
            FailoverLogEntry { vbuuid: 0xbeef, seqno: 77 },
            FailoverLogEntry { vbuuid: 0xdead, seqno: 0 },
        ];
        assert_eq!(parse_failover_log(&encode_failover_log(&entries)).unwrap(), entries);
    }

    #[test]
    fn hello_round_trip() {
        let frame = hello_request("test-client", &[0x03, 0x08, 0x12]);
        assert_eq!(frame.key, Bytes::from_static(b"test-client"));
        let mut response = frame.clone();
        response.magic = magic::RESPONSE;
        assert_eq!(parse_hello_response(&response).unwrap(), vec![0x03, 0x08, 0x12]);
    }

    #[test]
    fn sasl_plain_layout() {
        let frame = sasl_auth_plain("user", "pass");
        assert_eq!(frame.key, Bytes::from_static(b"PLAIN"));
        assert_eq!(frame.value, Bytes::from_static(b"\0user\0pass"));
    }

    #[test]
    fn mutation_round_trip() {
        let mutation = Mutation {
            vbucket: 512,
            by_seqno: 1000,
            rev_seqno: 3,
            flags: 0,
            expiration: 0,
            lock_time: 0,
            cas: 0xabcd,
            data_type: 1,
            key: Bytes::from_static(b"doc::1"),
            value: Bytes::from_static(b"{\"a\":1}"),
        };
        let frame = mutation.to_frame(99);
        assert_eq!(frame.extras.len(), 31);
        let parsed = Mutation::parse(&frame).unwrap();
        assert_eq!(parsed, mutation);
    }

    #[test]
    fn deletion_round_trip() {
        let deletion = Deletion {
            vbucket: 3,
            by_seqno: 88,
            rev_seqno: 2,
            cas: 5,
            key: Bytes::from_static(b"gone"),
        };
        let parsed = Deletion::parse(&deletion.to_frame(1)).unwrap();
        assert_eq!(parsed, deletion);
    }

    #[test]
    fn failover_log_round_trip() {
        let mut body = BytesMut::new();
        body.put_u64(0xaa);
        body.put_u64(200);
        body.put_u64(0xbb);
        body.put_u64(0);
        let entries = parse_failover_log(&body).unwrap();
        assert_eq!(
            entries,
            vec![
                FailoverLogEntry { vbuuid: 0xaa, seqno: 200 },
                FailoverLogEntry { vbuuid: 0xbb, seqno: 0 },
            ]
        );
    }

    #[test]
    fn failover_log_rejects_ragged_body() {
        assert!(parse_failover_log(&[0u8; 15]).is_err());
    }

    #[test]
    fn snapshot_marker_parses_flags() {
        let mut extras = BytesMut::new();
        extras.put_u64(10);
        extras.put_u64(20);
        extras.put_u32(snapshot_flags::DISK | snapshot_flags::CHECKPOINT);
        let mut frame = Frame::request(opcode::DCP_SNAPSHOT_MARKER);
        frame.vbucket_or_status = 1;
        frame.extras = extras.freeze();

        let marker = SnapshotMarker::parse(&frame).unwrap();
        assert_eq!(marker.start_seqno, 10);
        assert_eq!(marker.end_seqno, 20);
        assert_ne!(marker.flags & snapshot_flags::DISK, 0);
    }

    #[test]
    fn observe_seqno_round_trip() {
        let obs = ObserveSeqnoResponse {
            vbucket: 44,
            vbuuid: 7,
            persisted_seqno: 120,
            current_seqno: 150,
        };
        let parsed = ObserveSeqnoResponse::parse(&obs.to_frame(5)).unwrap();
        assert_eq!(parsed, obs);
    }

    #[test]
    fn truncated_bodies_error_instead_of_panicking() {
        let mut frame = Frame::request(opcode::DCP_MUTATION);
        frame.extras = Bytes::from_static(&[0u8; 10]);
        assert!(Mutation::parse(&frame).is_err());

        let mut frame = Frame::request(opcode::DCP_STREAM_END);
        frame.extras = Bytes::new();
        assert!(StreamEndMessage::parse(&frame).is_err());
    }

    #[test]
    fn stream_end_reason_round_trip() {
        let frame = StreamEndMessage::to_frame(9, 77, 2);
        let parsed = StreamEndMessage::parse(&frame).unwrap();
        assert_eq!(parsed.vbucket, 9);
        assert_eq!(parsed.reason, StreamEndReason::StateChanged);
    }
}
