//! Protocol module - Defines the channel between the UI and network processes
//!
//! Every frame is laid out as:
//! - 4 bytes magic
//! - 1 byte message type
//! - 4 bytes payload length (big-endian)
//! - 4 bytes sequence number (big-endian)
//! - bincode payload
//!
//! Frames never exceed [`MAX_FRAME_SIZE`]; body data is split so each
//! `BodyChunk` fits.

mod channel;
mod codec;
mod message;

pub use channel::*;
pub use codec::*;
pub use message::*;

/// Magic bytes for protocol identification
pub const MAGIC_BYTES: [u8; 4] = [0x53, 0x50, 0x59, 0x47]; // "SPYG"

/// Upper bound of a whole frame, header included
pub const MAX_FRAME_SIZE: usize = 16 * 1024;

/// Room reserved for the bincode envelope of a `BodyChunk`
const CHUNK_ENVELOPE: usize = 64;

/// Largest body slice carried by one `BodyChunk`
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE - CHUNK_ENVELOPE;

/// Longest text carried by an `Error` message
///
/// Error text may quote caller input such as the host name, so it is cut to
/// keep the frame within [`MAX_FRAME_SIZE`].
pub const MAX_ERROR_LEN: usize = 1024;
