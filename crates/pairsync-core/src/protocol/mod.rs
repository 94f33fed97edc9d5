//! Wire protocol between the two peers.
//!
//! The protocol is a raw byte stream with no handshake or version byte:
//! - Single-byte commands from the client steer the server's next action
//! - File batches are sequences of frames closed by a terminator frame

pub mod command;
pub mod frame;

pub use command::Command;
pub use frame::{FrameError, FrameHeader, HEADER_LEN, MAX_PATH_LEN, decode_path};
