// dcp-protocol: DCP wire framing, opcode tables, and typed messages.
//
// DCP is Couchbase's memcached-derived binary change protocol: every frame
// carries a fixed 24-byte header followed by extras, key, and value
// sections.  This crate owns the byte-level layer only; stream semantics
// (session state, flow control, reconnection) live in the client crate.

mod codec;
mod frame;
mod message;
#[path = "opcode.rs"]
mod opcode_tables;

pub use codec::{CodecError, FrameCodec, MAX_FRAME_LEN};
pub use frame::{Frame, HEADER_LEN, magic};
pub use message::{
    Deletion, END_SEQNO_INFINITY, Expiration, FailoverLogEntry, Mutation,
    ObserveSeqnoResponse, OsoSnapshot,
    SeqnoAdvanced, SnapshotMarker, StreamEndMessage, StreamRequestParams, SystemEvent,
    SystemEventKind, buffer_ack, close_stream, control, encode_failover_log,
    get_cluster_config, get_failover_log, hello_request, noop_reply, observe_seqno,
    open_connection, parse_control_response, parse_failover_log, parse_hello_response,
    parse_rollback_seqno, parse_stream_request, sasl_auth_plain, select_bucket,
    server_reply_not_supported, stream_request,
};
pub use opcode_tables::{
    StreamEndReason, feature, open_flags, opcode, oso_flags, snapshot_flags, status,
    status_name,
};
