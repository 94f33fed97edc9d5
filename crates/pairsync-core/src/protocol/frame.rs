//! File frame encoding.
//!
//! ```text
//! Header     := pathLength:u32 BE || fileSize:u32 BE
//! Frame      := Header || path[pathLength] || content[fileSize]
//! Terminator := Header(0, 0)
//! ```
//!
//! There is no checksum and no compression. Files of 4 GiB or more cannot be
//! expressed.

use std::io;
use std::path::{Component, Path};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of an encoded [`FrameHeader`].
pub const HEADER_LEN: usize = 8;

/// Longest path a frame may carry, in bytes.
pub const MAX_PATH_LEN: u32 = 4096;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Path is too long for a frame header: {0} bytes")]
    PathTooLong(usize),

    #[error("File {path} is too large for a frame header: {size} bytes")]
    FileTooLarge { path: String, size: u64 },

    #[error("Invalid path in frame: {0}")]
    InvalidPath(String),
}

/// Frame header: lengths of the path and the file content that follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub path_len: u32,
    pub file_size: u32,
}

impl FrameHeader {
    /// Marks the end of a batch.
    pub const TERMINATOR: Self = Self {
        path_len: 0,
        file_size: 0,
    };

    /// Header for sending `path` with `size` bytes of content.
    pub fn for_file(path: &str, size: u64) -> Result<Self, FrameError> {
        let path_len = u32::try_from(path.len())
            .ok()
            .filter(|len| *len <= MAX_PATH_LEN)
            .ok_or(FrameError::PathTooLong(path.len()))?;
        let file_size = u32::try_from(size).map_err(|_| FrameError::FileTooLarge {
            path: path.to_string(),
            size,
        })?;
        Ok(Self {
            path_len,
            file_size,
        })
    }

    /// Reject a received header whose path could not have come from a peer.
    pub fn check_path_len(&self) -> Result<(), FrameError> {
        if self.path_len > MAX_PATH_LEN {
            return Err(FrameError::PathTooLong(self.path_len as usize));
        }
        Ok(())
    }

    pub fn is_terminator(&self) -> bool {
        *self == Self::TERMINATOR
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..4].copy_from_slice(&self.path_len.to_be_bytes());
        bytes[4..].copy_from_slice(&self.file_size.to_be_bytes());
        bytes
    }

    pub fn decode(bytes: [u8; HEADER_LEN]) -> Self {
        let [a, b, c, d, e, f, g, h] = bytes;
        Self {
            path_len: u32::from_be_bytes([a, b, c, d]),
            file_size: u32::from_be_bytes([e, f, g, h]),
        }
    }

    /// Read a header from the stream.
    ///
    /// Returns `Ok(None)` if the stream ends before a full header arrives.
    pub async fn read_from<R>(reader: &mut R) -> io::Result<Option<Self>>
    where
        R: AsyncRead + Unpin,
    {
        let mut bytes = [0u8; HEADER_LEN];
        match reader.read_exact(&mut bytes).await {
            Ok(_) => Ok(Some(Self::decode(bytes))),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await
    }
}

/// Decode and validate a path received in a frame.
///
/// The path must be UTF-8, non-empty and relative, and must not climb out of
/// the receiver's root. `.` components are dropped so the result matches the
/// receiver's own record keys.
pub fn decode_path(bytes: Vec<u8>) -> Result<String, FrameError> {
    let path = String::from_utf8(bytes).map_err(|e| {
        FrameError::InvalidPath(String::from_utf8_lossy(e.as_bytes()).into_owned())
    })?;

    let mut parts = Vec::new();
    for component in Path::new(&path).components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => return Err(FrameError::InvalidPath(path.clone())),
            },
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(FrameError::InvalidPath(path.clone()));
            }
        }
    }

    if parts.is_empty() {
        return Err(FrameError::InvalidPath(path));
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_big_endian() {
        let header = FrameHeader {
            path_len: 5,
            file_size: 258,
        };
        assert_eq!(header.encode(), [0, 0, 0, 5, 0, 0, 1, 2]);
        assert_eq!(FrameHeader::decode(header.encode()), header);
    }

    #[test]
    fn test_terminator_is_all_zero() {
        assert_eq!(FrameHeader::TERMINATOR.encode(), [0u8; HEADER_LEN]);
        assert!(FrameHeader::decode([0u8; HEADER_LEN]).is_terminator());
        assert!(!FrameHeader::for_file("share/a", 0).unwrap().is_terminator());
    }

    #[test]
    fn test_for_file_rejects_large_files() {
        let err = FrameHeader::for_file("share/big.iso", u64::from(u32::MAX) + 1).unwrap_err();
        assert!(matches!(err, FrameError::FileTooLarge { size, .. } if size == 1 << 32));

        let max = FrameHeader::for_file("share/edge.bin", u64::from(u32::MAX)).unwrap();
        assert_eq!(max.file_size, u32::MAX);
    }

    #[test]
    fn test_path_length_is_capped() {
        let long = "a".repeat(MAX_PATH_LEN as usize + 1);
        assert!(matches!(
            FrameHeader::for_file(&long, 1),
            Err(FrameError::PathTooLong(len)) if len == long.len()
        ));
        assert!(FrameHeader::for_file(&long[1..], 1).is_ok());

        let garbage = FrameHeader::decode([0xff, 0xff, 0xff, 0xff, 0, 0, 0, 1]);
        assert!(matches!(
            garbage.check_path_len(),
            Err(FrameError::PathTooLong(len)) if len == u32::MAX as usize
        ));
        assert!(FrameHeader::for_file("share/a", 1).unwrap().check_path_len().is_ok());
    }

    #[tokio::test]
    async fn test_read_from_short_stream() {
        let mut short: &[u8] = &[0, 0, 0, 4, 0];
        assert_eq!(FrameHeader::read_from(&mut short).await.unwrap(), None);

        let mut empty: &[u8] = &[];
        assert_eq!(FrameHeader::read_from(&mut empty).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let header = FrameHeader::for_file("share/a.txt", 42).unwrap();
        let mut buf = Vec::new();
        header.write_to(&mut buf).await.unwrap();

        let mut reader = buf.as_slice();
        assert_eq!(
            FrameHeader::read_from(&mut reader).await.unwrap(),
            Some(header)
        );
    }

    #[test]
    fn test_decode_path_accepts_relative_paths() {
        assert_eq!(
            decode_path(b"share/docs/a.txt".to_vec()).unwrap(),
            "share/docs/a.txt"
        );
        assert_eq!(decode_path(b"./share/a.txt".to_vec()).unwrap(), "share/a.txt");
    }

    #[test]
    fn test_decode_path_rejects_escapes() {
        for bad in ["../etc/passwd", "share/../../x", "/etc/passwd", "", "."] {
            assert!(
                matches!(decode_path(bad.as_bytes().to_vec()), Err(FrameError::InvalidPath(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_decode_path_rejects_invalid_utf8() {
        assert!(matches!(
            decode_path(vec![b's', 0xff, 0xfe]),
            Err(FrameError::InvalidPath(_))
        ));
    }
}
