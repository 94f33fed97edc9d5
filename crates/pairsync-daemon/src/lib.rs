//! pairsync-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to drive two peers in one process.

pub mod config;
pub mod connection;
pub mod daemon;

// Re-export key types for convenience
pub use config::SyncConfig;
pub use connection::{ConnectError, LinkConfig, Mode, PeerLink, ResumePlan, Transition};
pub use daemon::{Daemon, RoundOutcome};
