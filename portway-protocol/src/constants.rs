//! Protocol constants

/// Size of the fixed frame header: kind(1) + tunnel_id(16) + payload_size(4).
pub const HEADER_SIZE: usize = 21;

/// Width of the tunnel id field in the header.
pub const TUNNEL_ID_SIZE: usize = 16;

/// Maximum payload size (16MB). Larger frames are a protocol error.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
