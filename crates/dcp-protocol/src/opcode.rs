//! Opcode, status, feature, and flag tables.
//!
//! Values follow the memcached binary protocol as implemented by Couchbase
//! Server.  Only the opcodes this client sends or receives are listed.

/// Request/response opcodes.
pub mod opcode {
    pub const HELLO: u8 = 0x1f;
    pub const SASL_LIST_MECHS: u8 = 0x20;
    pub const SASL_AUTH: u8 = 0x21;
    pub const SASL_STEP: u8 = 0x22;

    pub const DCP_OPEN: u8 = 0x50;
    pub const DCP_ADD_STREAM: u8 = 0x51;
    pub const DCP_CLOSE_STREAM: u8 = 0x52;
    pub const DCP_STREAM_REQ: u8 = 0x53;
    pub const DCP_GET_FAILOVER_LOG: u8 = 0x54;
    pub const DCP_STREAM_END: u8 = 0x55;
    pub const DCP_SNAPSHOT_MARKER: u8 = 0x56;
    pub const DCP_MUTATION: u8 = 0x57;
    pub const DCP_DELETION: u8 = 0x58;
    pub const DCP_EXPIRATION: u8 = 0x59;
    pub const DCP_NOOP: u8 = 0x5c;
    pub const DCP_BUFFER_ACK: u8 = 0x5d;
    pub const DCP_CONTROL: u8 = 0x5e;
    pub const DCP_SYSTEM_EVENT: u8 = 0x5f;
    pub const DCP_SEQNO_ADVANCED: u8 = 0x64;
    pub const DCP_OSO_SNAPSHOT: u8 = 0x65;

    pub const SELECT_BUCKET: u8 = 0x89;
    pub const OBSERVE_SEQNO: u8 = 0x91;
    pub const GET_CLUSTER_CONFIG: u8 = 0xb5;

    /// Server-initiated (magic 0x82) opcode: pushed cluster config.
    pub const CLUSTERMAP_CHANGE_NOTIFICATION: u8 = 0x01;
}

/// Response status codes.
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const KEY_ENOENT: u16 = 0x0001;
    pub const NOT_MY_VBUCKET: u16 = 0x0007;
    pub const AUTH_ERROR: u16 = 0x0020;
    pub const AUTH_CONTINUE: u16 = 0x0021;
    pub const ERANGE: u16 = 0x0022;
    pub const ROLLBACK: u16 = 0x0023;
    pub const NO_ACCESS: u16 = 0x0024;
    pub const UNKNOWN_COMMAND: u16 = 0x0081;
    pub const NOT_SUPPORTED: u16 = 0x0083;
    pub const UNKNOWN_COLLECTION: u16 = 0x0088;
}

/// Human-readable status label for logs.
pub fn status_name(code: u16) -> &'static str {
    match code {
        status::SUCCESS => "SUCCESS",
        status::KEY_ENOENT => "KEY_ENOENT",
        status::NOT_MY_VBUCKET => "NOT_MY_VBUCKET",
        status::AUTH_ERROR => "AUTH_ERROR",
        status::AUTH_CONTINUE => "AUTH_CONTINUE",
        status::ERANGE => "ERANGE",
        status::ROLLBACK => "ROLLBACK",
        status::NO_ACCESS => "NO_ACCESS",
        status::UNKNOWN_COMMAND => "UNKNOWN_COMMAND",
        status::NOT_SUPPORTED => "NOT_SUPPORTED",
        status::UNKNOWN_COLLECTION => "UNKNOWN_COLLECTION",
        _ => "OTHER",
    }
}

/// HELLO feature codes (u16, big-endian on the wire).
pub mod feature {
    pub const TLS: u16 = 0x02;
    pub const TCP_NODELAY: u16 = 0x03;
    pub const XATTR: u16 = 0x06;
    pub const XERROR: u16 = 0x07;
    pub const SELECT_BUCKET: u16 = 0x08;
    pub const SNAPPY: u16 = 0x0a;
    pub const JSON: u16 = 0x0b;
    pub const DUPLEX: u16 = 0x0c;
    pub const CLUSTERMAP_CHANGE_NOTIFICATION: u16 = 0x0d;
    pub const COLLECTIONS: u16 = 0x12;
}

/// DCP_OPEN flags.
pub mod open_flags {
    /// Ask the server to act as producer (we consume).
    pub const PRODUCER: u32 = 0x01;
    pub const INCLUDE_XATTRS: u32 = 0x04;
    pub const NO_VALUE: u32 = 0x08;
}

/// Snapshot-marker flags.
pub mod snapshot_flags {
    pub const MEMORY: u32 = 0x01;
    pub const DISK: u32 = 0x02;
    pub const CHECKPOINT: u32 = 0x04;
    pub const ACK: u32 = 0x08;
}

/// OSO snapshot flags.
pub mod oso_flags {
    pub const START: u32 = 0x01;
    pub const END: u32 = 0x02;
}

/// Why a stream ended, from the DCP_STREAM_END extras.
///
/// `ChannelDropped` is synthesized client-side when the connection dies with
/// streams open; it never appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndReason {
    Ok,
    Closed,
    StateChanged,
    Disconnected,
    TooSlow,
    BackfillFail,
    Rollback,
    FilterEmpty,
    LostPrivileges,
    ChannelDropped,
    Unknown(u32),
}

impl StreamEndReason {
    pub fn from_wire(raw: u32) -> Self {
        match raw {
            0 => StreamEndReason::Ok,
            1 => StreamEndReason::Closed,
            2 => StreamEndReason::StateChanged,
            3 => StreamEndReason::Disconnected,
            4 => StreamEndReason::TooSlow,
            5 => StreamEndReason::BackfillFail,
            6 => StreamEndReason::Rollback,
            7 => StreamEndReason::FilterEmpty,
            8 => StreamEndReason::LostPrivileges,
            other => StreamEndReason::Unknown(other),
        }
    }

    /// OK is the only terminal reason; everything else is eligible for
    /// automatic re-open.
    pub fn is_terminal(self) -> bool {
        self == StreamEndReason::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_end_reason_wire_mapping() {
        assert_eq!(StreamEndReason::from_wire(0), StreamEndReason::Ok);
        assert_eq!(StreamEndReason::from_wire(4), StreamEndReason::TooSlow);
        assert_eq!(StreamEndReason::from_wire(99), StreamEndReason::Unknown(99));
    }

    #[test]
    fn only_ok_is_terminal() {
        assert!(StreamEndReason::Ok.is_terminal());
        assert!(!StreamEndReason::Closed.is_terminal());
        assert!(!StreamEndReason::StateChanged.is_terminal());
        assert!(!StreamEndReason::ChannelDropped.is_terminal());
    }
}
