//! Frame boundary detection and (de)serialization.
//!
//! A [`FrameCodec`] works directly on the connection's [`ElasticBuffer`]s:
//! `decode` consumes exactly one frame from the read cursor, or nothing at
//! all when the frame is still incomplete.

use bytes::Bytes;

use crate::buffer::ElasticBuffer;
use crate::error::LinkError;
use crate::frame::{Frame, FrameHeader, HEADER_SIZE, payload_checksum};

/// Codec contract used by the connection loop.
pub trait FrameCodec: Send + Sync + 'static {
    type Message: Send + 'static;

    /// Extract one message from `src`.
    ///
    /// - `Ok(Some(_))`: one frame consumed.
    /// - `Ok(None)`: incomplete frame, `src` untouched.
    /// - `Err(_)`: malformed input; the rest of the stream is unusable.
    fn decode(&self, src: &mut ElasticBuffer) -> Result<Option<Self::Message>, LinkError>;

    /// Append the wire form of `message` to `dst`.
    fn encode(&self, message: &Self::Message, dst: &mut ElasticBuffer) -> Result<(), LinkError>;
}

/// Codec for [`Frame`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkCodec;

impl FrameCodec for LinkCodec {
    type Message = Frame;

    fn decode(&self, src: &mut ElasticBuffer) -> Result<Option<Frame>, LinkError> {
        let Some(raw_header) = src.peek(HEADER_SIZE) else {
            return Ok(None);
        };
        let header = FrameHeader::decode(raw_header)?;

        let Some(raw_frame) = src.peek(header.frame_len()) else {
            return Ok(None);
        };
        let payload = Bytes::copy_from_slice(&raw_frame[HEADER_SIZE..]);
        if payload_checksum(&payload) != header.checksum {
            return Err(LinkError::ChecksumMismatch);
        }

        src.advance_read(header.frame_len());
        Ok(Some(Frame::from_parts(header, payload)))
    }

    fn encode(&self, message: &Frame, dst: &mut ElasticBuffer) -> Result<(), LinkError> {
        dst.append(&message.header().encode());
        dst.append(message.payload());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;

    fn encoded(frame: &Frame) -> Vec<u8> {
        let mut buf = ElasticBuffer::new(0);
        LinkCodec.encode(frame, &mut buf).unwrap();
        buf.unread().to_vec()
    }

    #[test]
    fn decodes_one_frame_at_a_time() {
        let a = Frame::request(1, &b"first"[..]).unwrap();
        let b = Frame::response(2, &b"second"[..]).unwrap();
        let mut buf = ElasticBuffer::new(16);
        buf.append(&encoded(&a));
        buf.append(&encoded(&b));

        assert_eq!(LinkCodec.decode(&mut buf).unwrap(), Some(a));
        assert_eq!(LinkCodec.decode(&mut buf).unwrap(), Some(b));
        assert_eq!(LinkCodec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_frame_leaves_cursor() {
        let frame = Frame::request(5, vec![1u8; 64]).unwrap();
        let wire = encoded(&frame);

        let mut buf = ElasticBuffer::new(256);
        buf.append(&wire[..10]);
        assert_eq!(LinkCodec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.readable(), 10);

        buf.append(&wire[10..HEADER_SIZE + 3]);
        assert_eq!(LinkCodec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.read_index(), 0);

        buf.append(&wire[HEADER_SIZE + 3..]);
        let decoded = LinkCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind(), FrameKind::Request);
        assert_eq!(decoded.payload().len(), 64);
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut wire = encoded(&Frame::request(1, &b"payload"[..]).unwrap());
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;

        let mut buf = ElasticBuffer::new(64);
        buf.append(&wire);
        assert!(matches!(
            LinkCodec.decode(&mut buf),
            Err(LinkError::ChecksumMismatch)
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let mut buf = ElasticBuffer::new(64);
        buf.append(&[0xAB; 40]);
        assert!(LinkCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn empty_payload_frames() {
        let mut buf = ElasticBuffer::new(8);
        buf.append(&encoded(&Frame::disconnect()));
        let frame = LinkCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.kind(), FrameKind::Disconnect);
        assert!(frame.payload().is_empty());
    }
}
