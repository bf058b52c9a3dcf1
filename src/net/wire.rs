//! KMSG wire format
//!
//! A fixed header carries the `BUS0` magic and five big-endian u32 payload
//! lengths, followed by the payloads in order:
//!
//! ```text
//! magic[4] | name_len | to_len | from_len | signature_len | body_len
//! name | to | from | signature | body
//! ```
//!
//! Lengths above the caps below tear the connection down.

use bytes::{Buf, BytesMut};

use crate::aid::Aid;
use crate::message::MessageBase;

pub const BUS_MAGIC: [u8; 4] = *b"BUS0";
pub const HTTP_MAGIC: [u8; 4] = *b"HTTP";

pub const MSG_HEADER_LEN: usize = 24;

pub const MAX_KMSG_NAME_LEN: u32 = 1024;
pub const MAX_KMSG_TO_LEN: u32 = 1024;
pub const MAX_KMSG_FROM_LEN: u32 = 1024;
pub const MAX_KMSG_SIGNATURE_LEN: u32 = 2 * 1024;
pub const MAX_KMSG_BODY_LEN: u32 = 100 * 1024 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("bad magic {0:?}")]
    BadMagic([u8; 4]),

    #[error("{field} length {len} exceeds limit {max}")]
    FieldTooLarge {
        field: &'static str,
        len: u32,
        max: u32,
    },

    #[error("frame field is not valid utf-8")]
    InvalidUtf8,
}

/// Stream classification from the first four received bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum WireProtocol {
    Unknown = 0,
    Kmsg = 1,
    HttpReq = 2,
    HttpRsp = 3,
}

impl WireProtocol {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Kmsg,
            2 => Self::HttpReq,
            3 => Self::HttpRsp,
            _ => Self::Unknown,
        }
    }

    pub fn is_http(self) -> bool {
        matches!(self, Self::HttpReq | Self::HttpRsp)
    }
}

/// Classifies a fresh stream: our magic means KMSG, `HTTP` opens a response
/// (a status line), anything else is taken for an HTTP request.
pub fn classify(prefix: &[u8; 4]) -> WireProtocol {
    if *prefix == BUS_MAGIC {
        WireProtocol::Kmsg
    } else if *prefix == HTTP_MAGIC {
        WireProtocol::HttpRsp
    } else {
        WireProtocol::HttpReq
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub name_len: u32,
    pub to_len: u32,
    pub from_len: u32,
    pub signature_len: u32,
    pub body_len: u32,
}

impl MsgHeader {
    fn parse(raw: &[u8]) -> Result<Self, CodecError> {
        debug_assert!(raw.len() >= MSG_HEADER_LEN);
        let magic = [raw[0], raw[1], raw[2], raw[3]];
        if magic != BUS_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let field = |at: usize| u32::from_be_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let header = Self {
            name_len: field(4),
            to_len: field(8),
            from_len: field(12),
            signature_len: field(16),
            body_len: field(20),
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), CodecError> {
        let checks = [
            ("name", self.name_len, MAX_KMSG_NAME_LEN),
            ("to", self.to_len, MAX_KMSG_TO_LEN),
            ("from", self.from_len, MAX_KMSG_FROM_LEN),
            ("signature", self.signature_len, MAX_KMSG_SIGNATURE_LEN),
            ("body", self.body_len, MAX_KMSG_BODY_LEN),
        ];
        for (field, len, max) in checks {
            if len > max {
                return Err(CodecError::FieldTooLarge { field, len, max });
            }
        }
        Ok(())
    }

    fn payload_len(&self) -> usize {
        self.name_len as usize
            + self.to_len as usize
            + self.from_len as usize
            + self.signature_len as usize
            + self.body_len as usize
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&BUS_MAGIC);
        out.extend_from_slice(&self.name_len.to_be_bytes());
        out.extend_from_slice(&self.to_len.to_be_bytes());
        out.extend_from_slice(&self.from_len.to_be_bytes());
        out.extend_from_slice(&self.signature_len.to_be_bytes());
        out.extend_from_slice(&self.body_len.to_be_bytes());
    }
}

/// Frames a message. The returned head holds everything up to the body so
/// the body itself is written from the message without another copy. The
/// wire `from` advertises `sender-name@advertise_url` when an advertise url
/// is configured.
pub fn encode_frame(msg: &MessageBase, advertise_url: &str) -> Result<Vec<u8>, CodecError> {
    let from = if advertise_url.is_empty() {
        msg.from.to_string()
    } else {
        format!("{}@{}", msg.from.name(), advertise_url)
    };
    let to = msg.to.to_string();
    let header = MsgHeader {
        name_len: field_len("name", msg.name.len(), MAX_KMSG_NAME_LEN)?,
        to_len: field_len("to", to.len(), MAX_KMSG_TO_LEN)?,
        from_len: field_len("from", from.len(), MAX_KMSG_FROM_LEN)?,
        signature_len: field_len("signature", msg.signature.len(), MAX_KMSG_SIGNATURE_LEN)?,
        body_len: field_len("body", msg.body.len(), MAX_KMSG_BODY_LEN)?,
    };
    let mut head = Vec::with_capacity(MSG_HEADER_LEN + header.payload_len() - msg.body.len());
    header.encode_into(&mut head);
    head.extend_from_slice(msg.name.as_bytes());
    head.extend_from_slice(to.as_bytes());
    head.extend_from_slice(from.as_bytes());
    head.extend_from_slice(&msg.signature);
    Ok(head)
}

fn field_len(field: &'static str, len: usize, max: u32) -> Result<u32, CodecError> {
    if len > max as usize {
        return Err(CodecError::FieldTooLarge {
            field,
            len: len.min(u32::MAX as usize) as u32,
            max,
        });
    }
    Ok(len as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    Body(MsgHeader),
}

/// Incremental KMSG parser. Feed bytes into a [`BytesMut`] in whatever
/// chunks the socket produces and call [`KmsgDecoder::decode`] until it
/// returns `None`.
#[derive(Debug)]
pub struct KmsgDecoder {
    state: DecodeState,
}

impl Default for KmsgDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl KmsgDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
        }
    }

    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<MessageBase>, CodecError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < MSG_HEADER_LEN {
                        return Ok(None);
                    }
                    let header = MsgHeader::parse(&buf[..MSG_HEADER_LEN])?;
                    buf.advance(MSG_HEADER_LEN);
                    self.state = DecodeState::Body(header);
                }
                DecodeState::Body(header) => {
                    if buf.len() < header.payload_len() {
                        buf.reserve(header.payload_len() - buf.len());
                        return Ok(None);
                    }
                    let msg = Self::finish(&header, buf)?;
                    self.state = DecodeState::Header;
                    return Ok(Some(msg));
                }
            }
        }
    }

    fn finish(header: &MsgHeader, buf: &mut BytesMut) -> Result<MessageBase, CodecError> {
        fn take_str(buf: &mut BytesMut, len: u32) -> Result<String, CodecError> {
            let raw = buf.split_to(len as usize);
            String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
        }
        let name = take_str(buf, header.name_len)?;
        let to = take_str(buf, header.to_len)?;
        let from = take_str(buf, header.from_len)?;
        let signature = buf.split_to(header.signature_len as usize).to_vec();
        let body = buf.split_to(header.body_len as usize).to_vec();
        Ok(MessageBase::new(Aid::parse(&from), Aid::parse(&to), name, body)
            .with_signature(signature))
    }
}
