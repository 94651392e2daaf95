//! Frame and message-kind definitions

use crate::constants::{HEADER_SIZE, MAX_FRAME_SIZE, TUNNEL_ID_SIZE};
use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Wire message kinds. Any other byte on the wire is a fatal protocol error
/// for the link that carried it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    TunnelRegistration = 1,
    DataForward = 2,
    DataResponse = 3,
    ConnectionClose = 4,
    Heartbeat = 5,
    Error = 6,
    Acknowledge = 7,
}

impl MessageKind {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(MessageKind::TunnelRegistration),
            2 => Ok(MessageKind::DataForward),
            3 => Ok(MessageKind::DataResponse),
            4 => Ok(MessageKind::ConnectionClose),
            5 => Ok(MessageKind::Heartbeat),
            6 => Ok(MessageKind::Error),
            7 => Ok(MessageKind::Acknowledge),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One protocol message on a link.
///
/// Serializes to `kind(1) | tunnel_id(16, right-zero-padded ASCII, truncated)
/// | payload_size(4, big-endian) | payload`. The payload is an opaque byte
/// region at this layer; see [`crate::payload`] for the typed records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub tunnel_id: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: MessageKind, tunnel_id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            kind,
            tunnel_id: tunnel_id.into(),
            payload,
        }
    }

    /// Total encoded size of this frame.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode into a freshly allocated buffer.
    ///
    /// Fails with `FrameTooLarge` when the payload exceeds [`MAX_FRAME_SIZE`].
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Encode into the supplied buffer.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.payload.len() as u64 > u64::from(MAX_FRAME_SIZE) {
            return Err(ProtocolError::FrameTooLarge {
                size: self.payload.len() as u64,
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(self.encoded_len());
        dst.put_u8(self.kind.as_u8());
        dst.put_slice(&pad_tunnel_id(&self.tunnel_id));
        #[allow(clippy::cast_possible_truncation)]
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Decode one frame from a complete byte slice.
    ///
    /// The slice must contain the whole frame; use [`crate::FrameCodec`] for
    /// streaming decode from a socket.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::ShortHeader(data.len()));
        }

        let kind = MessageKind::try_from(data[0])?;
        let tunnel_id = strip_tunnel_id(&data[1..1 + TUNNEL_ID_SIZE]);

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[17..HEADER_SIZE]);
        let payload_size = u32::from_be_bytes(len_bytes);

        if payload_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: u64::from(payload_size),
                max: MAX_FRAME_SIZE,
            });
        }
        if data.len() < HEADER_SIZE + payload_size as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: u64::from(payload_size),
                max: (data.len() - HEADER_SIZE) as u32,
            });
        }

        Ok(Self {
            kind,
            tunnel_id,
            payload: Bytes::copy_from_slice(&data[HEADER_SIZE..HEADER_SIZE + payload_size as usize]),
        })
    }
}

/// Right-zero-pad (or truncate) a tunnel id to the fixed header width.
pub fn pad_tunnel_id(id: &str) -> [u8; TUNNEL_ID_SIZE] {
    let mut out = [0u8; TUNNEL_ID_SIZE];
    let bytes = id.as_bytes();
    let len = bytes.len().min(TUNNEL_ID_SIZE);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Recover a tunnel id from the header field, stripping all trailing NULs.
pub fn strip_tunnel_id(raw: &[u8]) -> String {
    let end = raw
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |pos| pos + 1);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
