//! Length-prefixed frame codec for [`tokio_util::codec::Framed`].
//!
//! Emits complete frames only; a partial header or body keeps the bytes
//! buffered until more arrive.  A body length above [`MAX_FRAME_LEN`] or an
//! unknown magic is unrecoverable for the connection: the decoder returns an
//! error and the channel must be torn down.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Frame, HEADER_LEN, magic};

/// Hard cap on the body length field.  The server's default max item size is
/// 20 MiB; anything larger than this is a corrupt length prefix, not data.
pub const MAX_FRAME_LEN: usize = 21 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown magic byte 0x{0:02x}")]
    BadMagic(u8),
    #[error("frame body length {0} exceeds cap {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),
    #[error("body sections exceed total body length ({key_len} key + {extras_len} extras > {body_len})")]
    BadSectionLengths {
        key_len: usize,
        extras_len: usize,
        body_len: usize,
    },
    #[error("truncated {0} body: {1} bytes")]
    Truncated(&'static str, usize),
}

/// Stateless decoder/encoder pair; one instance per connection.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if !magic::is_known(src[0]) {
            return Err(CodecError::BadMagic(src[0]));
        }

        let body_len = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
        if body_len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(body_len));
        }

        let key_len = u16::from_be_bytes([src[2], src[3]]) as usize;
        let extras_len = src[4] as usize;
        if key_len + extras_len > body_len {
            return Err(CodecError::BadSectionLengths {
                key_len,
                extras_len,
                body_len,
            });
        }

        let total = HEADER_LEN + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        Ok(Some(Frame::from_complete(src)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        frame.encode(dst);
        Ok(())
    }
}
