//! Send and receive halves of a sync exchange.
//!
//! Both procedures work on any async byte stream, so the daemon drives them
//! over a `TcpStream` and tests drive them over buffers.
//!
//! Every path goes through the same recorder lifecycle:
//! - sender: `set_ownership(true)` → frame → `add_record`
//! - receiver: `delete_record` → `set_ownership(false)` → payload → `add_record`
//!
//! A disconnect at any point leaves the record without an `mtime`, which is
//! what decides who retries the file in the next session.

use crate::protocol::{FrameError, FrameHeader, HEADER_LEN, decode_path};
use crate::recorder::{Recorder, RecorderError};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Chunk size for streaming file content onto the wire.
const SEND_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connection(#[source] io::Error),

    #[error("Local I/O error on {path}: {source}")]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl SessionError {
    fn local(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Local {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the error came from the channel (recoverable by reconnecting)
    /// rather than from the local filesystem.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Frame(_))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Files pushed by [`send_files`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendSummary {
    pub sent: Vec<String>,
}

/// How a receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveEnd {
    /// The sender closed the batch with a terminator frame
    Terminator,
    /// The stream ended before a full header arrived
    StreamClosed,
}

/// Files pulled by [`receive_files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveSummary {
    pub received: Vec<String>,
    pub end: ReceiveEnd,
}

/// Send every unsent file as a frame, then the terminator.
pub async fn send_files<W>(writer: &mut W, recorder: &mut Recorder) -> Result<SendSummary>
where
    W: AsyncWrite + Unpin,
{
    let unsent = recorder.get_unsent_files()?;
    if !unsent.is_empty() {
        info!("New file(s) found, sending {} file(s)", unsent.len());
    }

    let mut summary = SendSummary::default();
    for path in unsent {
        let full_path = recorder.resolve(&path);
        let mut file = File::open(&full_path)
            .await
            .map_err(SessionError::local(&full_path))?;
        let size = file
            .metadata()
            .await
            .map_err(SessionError::local(&full_path))?
            .len();

        let header = match FrameHeader::for_file(&path, size) {
            Ok(header) => header,
            Err(e @ (FrameError::FileTooLarge { .. } | FrameError::PathTooLong(_))) => {
                warn!("Skipping {}: {}", path, e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        recorder.set_ownership(&path, true)?;
        info!("Sending {}", path);

        let mut head = Vec::with_capacity(HEADER_LEN + path.len());
        head.extend_from_slice(&header.encode());
        head.extend_from_slice(path.as_bytes());
        writer
            .write_all(&head)
            .await
            .map_err(SessionError::Connection)?;

        stream_file(&mut file, &full_path, u64::from(header.file_size), writer).await?;
        writer.flush().await.map_err(SessionError::Connection)?;

        recorder.add_record(&path)?;
        summary.sent.push(path);
    }

    FrameHeader::TERMINATOR
        .write_to(writer)
        .await
        .map_err(SessionError::Connection)?;
    writer.flush().await.map_err(SessionError::Connection)?;

    debug!("Send complete: {} file(s)", summary.sent.len());
    Ok(summary)
}

/// Copy exactly `size` bytes of `file` to the writer.
async fn stream_file<W>(file: &mut File, full_path: &Path, size: u64, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; SEND_CHUNK_SIZE.min(size as usize).max(1)];
    let mut remaining = size;

    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = file
            .read(&mut buf[..want])
            .await
            .map_err(SessionError::local(full_path))?;
        if n == 0 {
            return Err(SessionError::Local {
                path: full_path.to_path_buf(),
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file shrank while it was being sent",
                ),
            });
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(SessionError::Connection)?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Receive frames until a terminator (or a short header) and write them under
/// the recorder root.
///
/// Socket reads are capped at `buffer_size` bytes.
pub async fn receive_files<R>(
    reader: &mut R,
    recorder: &mut Recorder,
    buffer_size: usize,
) -> Result<ReceiveSummary>
where
    R: AsyncRead + Unpin,
{
    let mut received = Vec::new();

    loop {
        let header = match FrameHeader::read_from(reader)
            .await
            .map_err(SessionError::Connection)?
        {
            Some(header) => header,
            None => {
                debug!("Stream closed at a frame boundary");
                return Ok(ReceiveSummary {
                    received,
                    end: ReceiveEnd::StreamClosed,
                });
            }
        };

        if header.is_terminator() {
            debug!("Receive complete: {} file(s)", received.len());
            return Ok(ReceiveSummary {
                received,
                end: ReceiveEnd::Terminator,
            });
        }

        header.check_path_len()?;
        let mut path_bytes = vec![0u8; header.path_len as usize];
        reader
            .read_exact(&mut path_bytes)
            .await
            .map_err(SessionError::Connection)?;
        let path = decode_path(path_bytes)?;
        if !recorder.is_shared(&path) {
            return Err(FrameError::InvalidPath(path).into());
        }

        recorder.delete_record(&path)?;
        recorder.set_ownership(&path, false)?;

        let full_path = recorder.resolve(&path);
        ensure_parent_dir(&full_path).await?;

        info!("Receiving {}", path);
        receive_payload(reader, &full_path, header.file_size as usize, buffer_size).await?;

        recorder.add_record(&path)?;
        received.push(path);
    }
}

/// Create the immediate parent of `full_path` if it is missing.
///
/// Only one level is created; a missing grandparent is a local error.
async fn ensure_parent_dir(full_path: &Path) -> Result<()> {
    let Some(parent) = full_path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    let exists = fs::try_exists(parent)
        .await
        .map_err(SessionError::local(parent))?;
    if !exists {
        debug!("Creating directory {}", parent.display());
        fs::create_dir(parent)
            .await
            .map_err(SessionError::local(parent))?;
    }
    Ok(())
}

async fn receive_payload<R>(
    reader: &mut R,
    full_path: &Path,
    file_size: usize,
    buffer_size: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut file = File::create(full_path)
        .await
        .map_err(SessionError::local(full_path))?;
    let mut buf = vec![0u8; file_size.min(buffer_size).max(1)];
    let mut remaining = file_size;

    while remaining > 0 {
        let want = remaining.min(buf.len());
        let n = reader
            .read(&mut buf[..want])
            .await
            .map_err(SessionError::Connection)?;
        if n == 0 {
            return Err(SessionError::Connection(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "stream closed with {} byte(s) of {} outstanding",
                    remaining,
                    full_path.display()
                ),
            )));
        }
        file.write_all(&buf[..n])
            .await
            .map_err(SessionError::local(full_path))?;
        remaining -= n;
    }

    // tokio finishes writes in the background; flush before the mtime is read.
    file.flush().await.map_err(SessionError::local(full_path))?;
    Ok(())
}
