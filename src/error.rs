//! Client error taxonomy.
//!
//! The host never observes raw I/O errors: channel-level failures are
//! translated into per-vbucket stream-end reasons for the affected vbuckets,
//! and everything that reaches the listener arrives as a [`DcpError`].

use dcp_protocol::{CodecError, StreamEndReason};

/// Errors surfaced to the application listener or returned from the
/// host-facing API.
#[derive(Debug, thiserror::Error)]
pub enum DcpError {
    /// Malformed frame, out-of-snapshot mutation, unexpected opcode.
    /// Fatal for the channel; the conductor reopens it.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Auth rejected, bucket not found, required feature not honored, or
    /// handshake timeout.  `permanent` failures stop automatic retry.
    #[error("handshake failed at {phase}: {detail}")]
    HandshakeFailure {
        phase: &'static str,
        detail: String,
        permanent: bool,
    },

    /// A stream ended for a non-OK reason; reopened automatically.
    #[error("stream ended: {0:?}")]
    StreamEnd(StreamEndReason),

    /// A stream open was refused outright (not a rollback).
    #[error("stream open failed on vbucket {vbucket} with status 0x{status:04x}")]
    StreamOpenFailed { vbucket: u16, status: u16 },

    /// In-band rollback notification (informational; handled internally).
    #[error("rollback to {0}")]
    Rollback(u64),

    /// I/O failure on a channel; the channel is torn down and replaced.
    #[error("channel dropped: {0}")]
    ChannelDropped(String),

    /// No reopen can recover from this; auto-recovery stops.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The client is not connected (API misuse or called after disconnect).
    #[error("client is not connected")]
    NotConnected,
}

impl DcpError {
    pub(crate) fn from_codec(e: CodecError) -> Self {
        match e {
            CodecError::Io(io) => DcpError::ChannelDropped(io.to_string()),
            other => DcpError::ProtocolViolation(other.to_string()),
        }
    }

    /// Whether the conductor should keep retrying after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DcpError::HandshakeFailure { permanent, .. } => !permanent,
            DcpError::Fatal(_) => false,
            DcpError::StreamEnd(reason) => !reason.is_terminal(),
            _ => true,
        }
    }
}
