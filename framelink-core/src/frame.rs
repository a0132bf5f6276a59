//! Frame model: header, kind and payload.
//!
//! ## Wire format
//!
//! Every frame is a fixed 28-byte little-endian header followed by the
//! payload:
//!
//! ```text
//! magic:          [u8; 4]  "FLK0"
//! kind:           u32      (see FrameKind)
//! request_id:     u64
//! payload_length: u32
//! checksum:       u32      first 4 bytes of blake3(payload), 0 if empty
//! reserved:       u32      must be 0
//! payload:        [u8]     payload_length bytes
//! ```

use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::LinkError;

// ── Constants ────────────────────────────────────────────────────

/// Magic prefix of every frame.
pub const MAGIC: [u8; 4] = *b"FLK0";

/// Encoded header size on the wire.
pub const HEADER_SIZE: usize = 28;

/// Largest payload a single frame may carry (4 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

// ── FrameKind ────────────────────────────────────────────────────

/// What a frame means to the receiver.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Expects a `Response` or `Reject` carrying the same request id.
    Request = 0x1,
    /// Successful answer to a request.
    Response = 0x2,
    /// Application-level refusal of a request; payload is the reason.
    Reject = 0x3,
    /// One-way message, never answered.
    Notify = 0x4,
    /// Asks the receiver to shut the connection down gracefully.
    Disconnect = 0x5,
}

impl TryFrom<u32> for FrameKind {
    type Error = LinkError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(FrameKind::Request),
            0x2 => Ok(FrameKind::Response),
            0x3 => Ok(FrameKind::Reject),
            0x4 => Ok(FrameKind::Notify),
            0x5 => Ok(FrameKind::Disconnect),
            _ => Err(LinkError::UnknownVariant {
                type_name: "FrameKind",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Request => write!(f, "Request"),
            FrameKind::Response => write!(f, "Response"),
            FrameKind::Reject => write!(f, "Reject"),
            FrameKind::Notify => write!(f, "Notify"),
            FrameKind::Disconnect => write!(f, "Disconnect"),
        }
    }
}

// ── FrameHeader ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub request_id: u64,
    pub payload_length: u32,
    pub checksum: u32,
}

impl FrameHeader {
    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&(self.kind as u32).to_le_bytes());
        buf[8..16].copy_from_slice(&self.request_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.payload_length.to_le_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Deserialize from the first [`HEADER_SIZE`] bytes of `data`.
    pub fn decode(data: &[u8]) -> Result<Self, LinkError> {
        if data.len() < HEADER_SIZE {
            return Err(LinkError::InvalidHeader("header truncated"));
        }
        if data[0..4] != MAGIC {
            return Err(LinkError::InvalidMagic);
        }
        let kind = FrameKind::try_from(read_u32(&data[4..8]))?;
        let request_id = read_u64(&data[8..16]);
        let payload_length = read_u32(&data[16..20]);
        let checksum = read_u32(&data[20..24]);
        if read_u32(&data[24..28]) != 0 {
            return Err(LinkError::InvalidHeader("reserved field must be zero"));
        }
        if payload_length as usize > MAX_PAYLOAD_SIZE {
            return Err(LinkError::PayloadTooLarge {
                size: payload_length as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if payload_length > 0 && checksum == 0 {
            return Err(LinkError::InvalidHeader("checksum must be non-zero"));
        }
        Ok(Self {
            kind,
            request_id,
            payload_length,
            checksum,
        })
    }

    /// Total encoded length of the frame this header introduces.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_length as usize
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}

/// First four bytes of the payload's blake3 hash; `0` for an empty payload.
///
/// A non-empty payload never yields `0`, which is reserved for "no payload".
pub fn payload_checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        return 0;
    }
    read_u32(&blake3::hash(payload).as_bytes()[0..4]).max(1)
}

// ── Frame ────────────────────────────────────────────────────────

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    request_id: u64,
    payload: Bytes,
}

impl Frame {
    /// Build a frame, rejecting payloads above [`MAX_PAYLOAD_SIZE`].
    pub fn new(kind: FrameKind, request_id: u64, payload: impl Into<Bytes>) -> Result<Self, LinkError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(LinkError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            kind,
            request_id,
            payload,
        })
    }

    pub fn request(request_id: u64, payload: impl Into<Bytes>) -> Result<Self, LinkError> {
        Self::new(FrameKind::Request, request_id, payload)
    }

    pub fn response(request_id: u64, payload: impl Into<Bytes>) -> Result<Self, LinkError> {
        Self::new(FrameKind::Response, request_id, payload)
    }

    /// A rejection of `request_id`; the reason travels as UTF-8 payload.
    pub fn reject(request_id: u64, reason: &str) -> Result<Self, LinkError> {
        Self::new(
            FrameKind::Reject,
            request_id,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    pub fn notify(payload: impl Into<Bytes>) -> Result<Self, LinkError> {
        Self::new(FrameKind::Notify, 0, payload)
    }

    pub fn disconnect() -> Self {
        Self {
            kind: FrameKind::Disconnect,
            request_id: 0,
            payload: Bytes::new(),
        }
    }

    /// A request whose payload is `body` encoded with bincode.
    pub fn request_with<T: Serialize>(request_id: u64, body: &T) -> Result<Self, LinkError> {
        let payload = bincode::serialize(body)?;
        Self::request(request_id, payload)
    }

    /// Decode the payload as a bincode-encoded `T`.
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T, LinkError> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The rejection reason of a `Reject` frame.
    pub fn reject_reason(&self) -> Option<String> {
        match self.kind {
            FrameKind::Reject => Some(String::from_utf8_lossy(&self.payload).into_owned()),
            _ => None,
        }
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            kind: self.kind,
            request_id: self.request_id,
            payload_length: self.payload.len() as u32,
            checksum: payload_checksum(&self.payload),
        }
    }

    pub(crate) fn from_parts(header: FrameHeader, payload: Bytes) -> Self {
        Self {
            kind: header.kind,
            request_id: header.request_id,
            payload,
        }
    }
}

// ── Envelope ─────────────────────────────────────────────────────

/// How a received message relates to outstanding requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    /// Answers a request successfully.
    Response,
    /// Refuses a request, with the peer's reason.
    Reject(String),
    /// Not a reply.
    Unsolicited,
}

/// Messages that can be matched against outstanding requests.
pub trait Envelope {
    /// Identifier shared by a request and its reply, if the message carries one.
    fn request_id(&self) -> Option<u64>;

    fn reply_kind(&self) -> ReplyKind;
}

impl Envelope for Frame {
    fn request_id(&self) -> Option<u64> {
        match self.kind {
            FrameKind::Request | FrameKind::Response | FrameKind::Reject => Some(self.request_id),
            FrameKind::Notify | FrameKind::Disconnect => None,
        }
    }

    fn reply_kind(&self) -> ReplyKind {
        match self.kind {
            FrameKind::Response => ReplyKind::Response,
            FrameKind::Reject => ReplyKind::Reject(self.reject_reason().unwrap_or_default()),
            _ => ReplyKind::Unsolicited,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn header_encode_decode() {
        let frame = Frame::request(42, &b"ping"[..]).unwrap();
        let header = frame.header();
        let decoded = FrameHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.frame_len(), HEADER_SIZE + 4);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut raw = Frame::disconnect().header().encode();
        raw[0] = b'X';
        assert!(matches!(FrameHeader::decode(&raw), Err(LinkError::InvalidMagic)));
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut raw = Frame::disconnect().header().encode();
        raw[4..8].copy_from_slice(&0x99u32.to_le_bytes());
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(LinkError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn oversized_length_rejected() {
        let mut raw = Frame::disconnect().header().encode();
        raw[16..20].copy_from_slice(&(MAX_PAYLOAD_SIZE as u32 + 1).to_le_bytes());
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(LinkError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn payload_too_large() {
        let too_large = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(Frame::request(1, too_large).is_err());
    }

    #[test]
    fn empty_payload_has_zero_checksum() {
        assert_eq!(payload_checksum(b""), 0);
        assert_ne!(payload_checksum(b"x"), 0);
    }

    #[test]
    fn reject_carries_reason() {
        let frame = Frame::reject(3, "no such method").unwrap();
        assert_eq!(frame.reject_reason().as_deref(), Some("no such method"));
        assert_eq!(frame.reply_kind(), ReplyKind::Reject("no such method".into()));
    }

    #[test]
    fn envelope_request_ids() {
        assert_eq!(Envelope::request_id(&Frame::response(7, Bytes::new()).unwrap()), Some(7));
        assert_eq!(Envelope::request_id(&Frame::notify(Bytes::new()).unwrap()), None);
        assert_eq!(Frame::notify(Bytes::new()).unwrap().reply_kind(), ReplyKind::Unsolicited);
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Greeting {
        name: String,
        retries: u8,
    }

    #[test]
    fn typed_body() {
        let body = Greeting {
            name: "peer".into(),
            retries: 2,
        };
        let frame = Frame::request_with(9, &body).unwrap();
        let back: Greeting = frame.decode_body().unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn display_format() {
        assert_eq!(FrameKind::Request.to_string(), "Request");
        assert_eq!(FrameKind::Disconnect.to_string(), "Disconnect");
    }
}
