//! The 24-byte binary frame header and the `Frame` type.
//!
//! # Header layout (all integers big-endian)
//!
//! | offset | width | field                                   |
//! |--------|-------|-----------------------------------------|
//! | 0      | 1     | magic                                   |
//! | 1      | 1     | opcode                                  |
//! | 2      | 2     | key length                              |
//! | 4      | 1     | extras length                           |
//! | 5      | 1     | data type                               |
//! | 6      | 2     | vbucket id (requests) / status (responses) |
//! | 8      | 4     | total body length (extras + key + value) |
//! | 12     | 4     | opaque                                  |
//! | 16     | 8     | cas                                     |

use bytes::{BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 24;

/// Frame direction magics.
pub mod magic {
    /// Client-initiated request.
    pub const REQUEST: u8 = 0x80;
    /// Server response to a client request.
    pub const RESPONSE: u8 = 0x81;
    /// Server-initiated request (duplex features, e.g. clustermap push).
    pub const SERVER_REQUEST: u8 = 0x82;
    /// Client response to a server-initiated request.
    pub const SERVER_RESPONSE: u8 = 0x83;

    pub fn is_known(m: u8) -> bool {
        matches!(m, REQUEST | RESPONSE | SERVER_REQUEST | SERVER_RESPONSE)
    }
}

/// One complete DCP frame.
///
/// The `vbucket_or_status` field is the vbucket id on request magics and the
/// status code on response magics; use [`Frame::vbucket`] / [`Frame::status`]
/// to read it under the right name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub magic: u8,
    pub opcode: u8,
    pub data_type: u8,
    pub vbucket_or_status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Frame {
    /// A client request with empty body sections.
    pub fn request(opcode: u8) -> Self {
        Frame {
            magic: magic::REQUEST,
            opcode,
            data_type: 0,
            vbucket_or_status: 0,
            opaque: 0,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// A client response to a server-initiated request, echoing its opaque.
    pub fn server_response(opcode: u8, opaque: u32, status: u16) -> Self {
        Frame {
            magic: magic::SERVER_RESPONSE,
            opcode,
            data_type: 0,
            vbucket_or_status: status,
            opaque,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn vbucket(&self) -> u16 {
        self.vbucket_or_status
    }

    pub fn status(&self) -> u16 {
        self.vbucket_or_status
    }

    pub fn is_response(&self) -> bool {
        self.magic == magic::RESPONSE
    }

    pub fn is_server_request(&self) -> bool {
        self.magic == magic::SERVER_REQUEST
    }

    /// Total encoded size, header included.  Flow-control accounting charges
    /// this value per frame.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.extras.len() + self.key.len() + self.value.len()
    }

    pub fn body_len(&self) -> usize {
        self.extras.len() + self.key.len() + self.value.len()
    }

    /// Append the encoded frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_len());
        dst.put_u8(self.magic);
        dst.put_u8(self.opcode);
        dst.put_u16(self.key.len() as u16);
        dst.put_u8(self.extras.len() as u8);
        dst.put_u8(self.data_type);
        dst.put_u16(self.vbucket_or_status);
        dst.put_u32(self.body_len() as u32);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
        dst.put_slice(&self.extras);
        dst.put_slice(&self.key);
        dst.put_slice(&self.value);
    }

    /// Split a complete wire image (header + full body) into a `Frame`.
    ///
    /// The caller (the codec) has already verified the length; this only
    /// slices, it does not validate.
    pub(crate) fn from_complete(buf: &mut BytesMut) -> Frame {
        let header = buf.split_to(HEADER_LEN);
        let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let extras_len = header[4] as usize;
        let body_len =
            u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let value_len = body_len - extras_len - key_len;

        let extras = buf.split_to(extras_len).freeze();
        let key = buf.split_to(key_len).freeze();
        let value = buf.split_to(value_len).freeze();

        Frame {
            magic: header[0],
            opcode: header[1],
            data_type: header[5],
            vbucket_or_status: u16::from_be_bytes([header[6], header[7]]),
            opaque: u32::from_be_bytes([header[12], header[13], header[14], header[15]]),
            cas: u64::from_be_bytes([
                header[16], header[17], header[18], header[19], header[20], header[21],
                header[22], header[23],
            ]),
            extras,
            key,
            value,
        }
    }
}
