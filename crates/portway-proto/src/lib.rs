//! Tunnel Protocol Definitions
//!
//! This crate defines the message types and frame codec shared by both
//! endpoints of a tunnel.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, TunnelCodec};
pub use messages::{ClientId, TunnelEvent, TunnelMessage};

/// Maximum encoded frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
