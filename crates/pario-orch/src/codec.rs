//! Framed MessagePack codec
//!
//! Frame layout: `[magic: u32][payload length: u32][payload]`, big endian,
//! payload encoded with `rmp_serde` using named fields.

use crate::CodecError;
use crate::protocol::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame magic, "PARI"
pub const FRAME_MAGIC: u32 = 0x5041_5249;

/// Bytes before the payload
pub const HEADER_LEN: usize = 8;

/// Maximum payload size (16MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Converts protocol messages to and from wire bytes
pub trait Codec: Send + Sync {
    fn encode(&self, message: &Message) -> Result<Bytes, CodecError>;

    fn decode(&self, frame: &[u8]) -> Result<Message, CodecError>;
}

/// [`Codec`] producing length-prefixed MessagePack frames
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn encode(&self, message: &Message) -> Result<Bytes, CodecError> {
        let payload =
            rmp_serde::to_vec_named(message).map_err(|e| CodecError::Encode(e.to_string()))?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::TooLarge(payload.len()));
        }
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u32(FRAME_MAGIC);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    fn decode(&self, frame: &[u8]) -> Result<Message, CodecError> {
        if frame.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN,
                available: frame.len(),
            });
        }
        let mut buf = frame;
        let magic = buf.get_u32();
        if magic != FRAME_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let len = buf.get_u32() as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(CodecError::TooLarge(len));
        }
        if buf.remaining() < len {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN + len,
                available: frame.len(),
            });
        }
        // decoding a request tree validates its arena
        rmp_serde::from_slice(&buf[..len]).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{IoAck, IoMode, IoRequest, status};
    use pario_dist::DistributionSpec;
    use pario_request::{Request, RequestTree};

    fn request() -> IoRequest {
        let byte = Request::byte();
        let tree = Request::hindexed(&[16, 8], &[0, 64], &byte).unwrap().commit();
        IoRequest {
            tag: 42,
            object: 7,
            mode: IoMode::Write,
            target_index: 1,
            target_count: 2,
            distribution: DistributionSpec::parse("varstrip:0:1K;1:2K").unwrap(),
            file_request: tree,
            request_offset: 0,
            length: 24,
        }
    }

    #[test]
    fn test_request_survives_encoding() {
        let codec = MsgPackCodec;
        let message = Message::Request(request());
        let frame = codec.encode(&message).unwrap();
        assert_eq!(&frame[..4], &FRAME_MAGIC.to_be_bytes());
        assert_eq!(codec.decode(&frame).unwrap(), message);
    }

    #[test]
    fn test_ack_tag() {
        let codec = MsgPackCodec;
        let message = Message::Ack(IoAck {
            tag: 9,
            status: status::OK,
            datafile_size: 1024,
        });
        let decoded = codec.decode(&codec.encode(&message).unwrap()).unwrap();
        assert_eq!(decoded.tag(), 9);
    }

    #[test]
    fn test_truncated_and_bad_frames() {
        let codec = MsgPackCodec;
        let frame = codec.encode(&Message::Request(request())).unwrap();

        assert!(matches!(
            codec.decode(&frame[..4]),
            Err(CodecError::Truncated { .. })
        ));
        assert!(matches!(
            codec.decode(&frame[..frame.len() - 1]),
            Err(CodecError::Truncated { .. })
        ));

        let mut bad = frame.to_vec();
        bad[0] ^= 0xff;
        assert!(matches!(codec.decode(&bad), Err(CodecError::BadMagic(_))));

        let mut garbage = BytesMut::new();
        garbage.put_u32(FRAME_MAGIC);
        garbage.put_u32(3);
        garbage.put_slice(&[0xc1, 0xc1, 0xc1]);
        assert!(matches!(codec.decode(&garbage), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_corrupt_tree_rejected_on_decode() {
        let mut message = request();
        let mut nodes = message.file_request.nodes().to_vec();
        nodes[0].element = Some(99);
        // bypass validation by encoding the raw node list in place of the tree
        message.file_request = RequestTree::contiguous(1).unwrap();
        let mut value = rmp_serde::to_vec_named(&Message::Request(message)).unwrap();
        let good_tree = rmp_serde::to_vec_named(&RequestTree::contiguous(1).unwrap()).unwrap();
        let bad_tree = rmp_serde::to_vec_named(&nodes).unwrap();
        let at = value
            .windows(good_tree.len())
            .position(|w| w == good_tree.as_slice())
            .unwrap();
        value.splice(at..at + good_tree.len(), bad_tree);

        let mut frame = BytesMut::new();
        frame.put_u32(FRAME_MAGIC);
        frame.put_u32(value.len() as u32);
        frame.put_slice(&value);
        assert!(matches!(
            MsgPackCodec.decode(&frame),
            Err(CodecError::Decode(_))
        ));
    }
}
