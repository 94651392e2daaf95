//! Portway wire protocol
//!
//! This crate defines the binary framing used on the data-plane link between
//! the Portway agent and the rendezvous server: a fixed 21-byte header
//! (`kind | tunnel_id | payload_size`) followed by a JSON payload record.

pub mod codec;
pub mod constants;
pub mod error;
pub mod frame;
pub mod payload;

pub use codec::FrameCodec;
pub use error::ProtocolError;
pub use frame::{Frame, MessageKind};
pub use payload::{
    Acknowledge, ConnectionClose, DataForward, DataResponse, Heartbeat, Payload,
    TunnelRegistration, WireError,
};
