//! The sync loop driving a peer for its whole lifetime.
//!
//! The client drives every round with two commands:
//! 1. `'s'`, then receive: pull the server's files
//! 2. `'r'`, then send: push our files
//!
//! The server only reads command bytes and does what it is told. A broken
//! connection on either side sends the link through [`PeerLink::resume`];
//! only local filesystem failures end the loop.

use std::time::Duration;

use anyhow::{Context, Result};
use pairsync_core::{
    Command, ReceiveEnd, Recorder, SessionError, receive_files, send_files,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connection::{Mode, PeerLink};

/// Result of one exchange with the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The exchange finished; counts of files moved each way
    Completed { sent: usize, received: usize },
    /// The peer closed the connection cleanly
    Disconnected,
}

impl RoundOutcome {
    fn is_idle(&self) -> bool {
        matches!(
            self,
            RoundOutcome::Completed {
                sent: 0,
                received: 0
            }
        )
    }
}

/// A sync peer: its link, its recorder, and the loop tying them together.
pub struct Daemon {
    link: PeerLink,
    recorder: Recorder,
    receive_buffer_size: usize,
    idle_interval: Duration,
}

impl Daemon {
    pub fn new(link: PeerLink, recorder: Recorder, config: &SyncConfig) -> Self {
        Self {
            link,
            recorder,
            receive_buffer_size: config.receive_buffer_size,
            idle_interval: config.idle_interval(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.link.mode()
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Negotiate the link if it is not up yet.
    pub async fn connect(&mut self) {
        if self.link.mode() == Mode::Unconnected {
            self.link.start().await;
        }
    }

    /// Sync until a local error occurs. Network failures are always recovered.
    pub async fn run(&mut self) -> Result<()> {
        self.connect().await;

        loop {
            match self.run_round().await {
                Ok(RoundOutcome::Disconnected) => {
                    info!("Connection closed by peer, trying to resume");
                    self.link.resume().await;
                }
                Ok(outcome) => {
                    if self.link.mode() == Mode::Client && outcome.is_idle() {
                        sleep(self.idle_interval).await;
                    }
                }
                Err(e) if e.is_connection() => {
                    warn!("Connection broken ({}), trying to resume", e);
                    self.link.resume().await;
                }
                Err(e) => return Err(e).context("Sync stopped by a local error"),
            }
        }
    }

    /// Perform one exchange in the current role.
    pub async fn run_round(&mut self) -> Result<RoundOutcome, SessionError> {
        let mode = self.link.mode();
        let Some(stream) = self.link.stream_mut() else {
            return Ok(RoundOutcome::Disconnected);
        };

        match mode {
            Mode::Server => {
                let mut command = [0u8; 1];
                let n = stream
                    .read(&mut command)
                    .await
                    .map_err(SessionError::Connection)?;
                if n == 0 {
                    return Ok(RoundOutcome::Disconnected);
                }

                match Command::from_byte(command[0]) {
                    Some(Command::Send) => {
                        let summary = send_files(stream, &mut self.recorder).await?;
                        Ok(RoundOutcome::Completed {
                            sent: summary.sent.len(),
                            received: 0,
                        })
                    }
                    Some(Command::Receive) => {
                        let summary =
                            receive_files(stream, &mut self.recorder, self.receive_buffer_size)
                                .await?;
                        if summary.end == ReceiveEnd::StreamClosed {
                            return Ok(RoundOutcome::Disconnected);
                        }
                        Ok(RoundOutcome::Completed {
                            sent: 0,
                            received: summary.received.len(),
                        })
                    }
                    None => {
                        warn!("Ignoring unknown command byte {:#04x}", command[0]);
                        Ok(RoundOutcome::Completed {
                            sent: 0,
                            received: 0,
                        })
                    }
                }
            }
            Mode::Client => {
                stream
                    .write_all(&[Command::Send.as_byte()])
                    .await
                    .map_err(SessionError::Connection)?;
                let received =
                    receive_files(stream, &mut self.recorder, self.receive_buffer_size).await?;
                if received.end == ReceiveEnd::StreamClosed {
                    return Ok(RoundOutcome::Disconnected);
                }

                stream
                    .write_all(&[Command::Receive.as_byte()])
                    .await
                    .map_err(SessionError::Connection)?;
                let sent = send_files(stream, &mut self.recorder).await?;

                let outcome = RoundOutcome::Completed {
                    sent: sent.sent.len(),
                    received: received.received.len(),
                };
                debug!("Round finished: {:?}", outcome);
                Ok(outcome)
            }
            Mode::Unconnected => Ok(RoundOutcome::Disconnected),
        }
    }
}
