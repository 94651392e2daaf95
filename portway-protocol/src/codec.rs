//! Streaming codec for protocol frames.
//!
//! Wraps the fixed 21-byte header format for use with
//! `tokio_util::codec::{FramedRead, FramedWrite}`.

use crate::constants::{HEADER_SIZE, MAX_FRAME_SIZE, TUNNEL_ID_SIZE};
use crate::error::ProtocolError;
use crate::frame::{strip_tunnel_id, Frame, MessageKind};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame codec for the data-plane link.
///
/// Decoding is incremental: partial input yields `Ok(None)` until the full
/// header and payload have arrived. An oversized `payload_size` fails before
/// any payload byte is read.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec with a custom payload size limit (tests, constrained peers).
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        // Peek the declared payload size before consuming the header.
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[HEADER_SIZE - 4..HEADER_SIZE]);
        let payload_size = u32::from_be_bytes(len_bytes);

        if payload_size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: u64::from(payload_size),
                max: self.max_frame_size,
            });
        }

        let total = HEADER_SIZE + payload_size as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let kind = MessageKind::try_from(src[0])?;
        let tunnel_id = strip_tunnel_id(&src[1..1 + TUNNEL_ID_SIZE]);
        src.advance(HEADER_SIZE);
        let payload = src.split_to(payload_size as usize).freeze();

        Ok(Some(Frame {
            kind,
            tunnel_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() as u64 > u64::from(self.max_frame_size) {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.payload.len() as u64,
                max: self.max_frame_size,
            });
        }
        frame.encode_into(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_codec_round_trip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frame = Frame::new(
            MessageKind::Heartbeat,
            "tun_hb",
            Bytes::from_static(b"{\"timestamp\":1}"),
        );
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, decoded);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_yields_none() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frame = Frame::new(
            MessageKind::DataForward,
            "tun_x",
            Bytes::from_static(b"0123456789abcdef"),
        );
        codec.encode(frame, &mut buf).unwrap();

        let full_len = buf.len();
        let mut partial = buf.split_to(full_len / 2);

        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frames: Vec<Frame> = (0..3)
            .map(|i| {
                Frame::new(
                    MessageKind::Acknowledge,
                    format!("tun_{i}"),
                    Bytes::from(format!("payload-{i}")),
                )
            })
            .collect();

        for frame in &frames {
            codec.encode(frame.clone(), &mut buf).unwrap();
        }
        for expected in &frames {
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(*expected, decoded);
        }
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_oversized_declared_payload_fails_before_read() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        // Hand-build a header declaring a payload beyond the limit; supply
        // no payload bytes at all.
        buf.extend_from_slice(&[MessageKind::Heartbeat.as_u8()]);
        buf.extend_from_slice(&[0u8; TUNNEL_ID_SIZE]);
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_unknown_kind_is_fatal() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&[0xFFu8]);
        buf.extend_from_slice(&[0u8; TUNNEL_ID_SIZE]);
        buf.extend_from_slice(&0u32.to_be_bytes());

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind(0xFF)));
    }

    #[test]
    fn test_custom_limit_enforced_on_encode() {
        let mut codec = FrameCodec::with_max_frame_size(8);
        let mut buf = BytesMut::new();
        let frame = Frame::new(
            MessageKind::DataResponse,
            "t",
            Bytes::from_static(b"123456789"),
        );
        assert!(codec.encode(frame, &mut buf).is_err());
    }
}
