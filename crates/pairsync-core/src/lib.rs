//! pairsync-core: Two-peer file synchronization over a raw byte stream.
//!
//! This crate provides the transport-independent parts of a sync peer:
//! - The recorder, which persists per-path transfer state
//! - The framing protocol for file batches and commands
//! - The send/receive procedures that move files across a stream

pub mod protocol;
pub mod recorder;
pub mod session;

pub use protocol::{Command, FrameError, FrameHeader};
pub use recorder::{Recorder, RecorderError, TransferRecord};
pub use session::{
    ReceiveEnd, ReceiveSummary, SendSummary, SessionError, receive_files, send_files,
};
