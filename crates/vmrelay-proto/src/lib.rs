//! Relay Protocol Definitions
//!
//! This crate defines the target identifiers, control messages, and
//! multiplexing primitives spoken between the tunnel client and the
//! identity-aware relay endpoint.

pub mod messages;
pub mod mux;
pub mod target;

pub use messages::{RefusalReason, RelayMessage};
pub use mux::{Frame, FrameFlags, FrameHeader, FrameType, ProtoError, StreamId};
pub use target::Target;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Reserved stream ID for control messages
pub const CONTROL_STREAM_ID: u32 = 0;
