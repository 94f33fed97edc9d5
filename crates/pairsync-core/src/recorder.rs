//! Persistent per-path transfer state.
//!
//! The recorder keeps one [`TransferRecord`] per synced path and rewrites the
//! whole snapshot (`sync_record.json` by default) after every mutation:
//!
//! ```json
//! {
//!     "share/notes.txt": {"ownership": true, "mtime": 1700000000.25},
//!     "share/draft.txt": {"ownership": false}
//! }
//! ```
//!
//! A record with no `mtime` marks a transfer that started but never finished.
//! Paths are `/`-separated and relative to the recorder root, including the
//! share directory prefix.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, Metadata};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode transfer records: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No transfer record for {0}")]
    MissingRecord(String),

    #[error("Failed to walk share directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),
}

pub type Result<T> = std::result::Result<T, RecorderError>;

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> RecorderError + '_ {
    move |source| RecorderError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Transfer state of a single path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// `true` if this peer sent (owns) the latest transfer of the path
    pub ownership: bool,
    /// Modification time (seconds since epoch) once the transfer completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<f64>,
}

impl TransferRecord {
    /// A transfer that has started but not completed.
    pub fn pending(ownership: bool) -> Self {
        Self {
            ownership,
            mtime: None,
        }
    }

    /// Whether the transfer of this path completed.
    pub fn is_complete(&self) -> bool {
        self.mtime.is_some()
    }
}

/// Modification time of `metadata` as fractional seconds since the epoch.
pub fn mtime_secs(metadata: &Metadata) -> io::Result<f64> {
    let modified = metadata.modified()?;
    let since_epoch = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(since_epoch.as_secs_f64())
}

/// Tracks which files have been synced and which transfers were interrupted.
pub struct Recorder {
    /// Directory all record paths are relative to
    root: PathBuf,
    /// Share directory, relative to `root`
    share_dir: PathBuf,
    /// Location of the JSON snapshot
    record_path: PathBuf,
    /// In-memory copy of the snapshot
    records: BTreeMap<String, TransferRecord>,
}

impl Recorder {
    /// Open the recorder rooted at `root`.
    ///
    /// Loads the snapshot at `root/record_file`. A missing or unreadable
    /// snapshot starts an empty store, so a corrupted file only costs a
    /// full resend.
    pub fn open(
        root: impl Into<PathBuf>,
        share_dir: impl Into<PathBuf>,
        record_file: impl AsRef<Path>,
    ) -> Result<Self> {
        let root = root.into();
        let record_path = root.join(record_file);

        let records = match fs::read_to_string(&record_path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(records) => records,
                Err(e) => {
                    warn!(
                        "Ignoring unreadable record file {}: {}",
                        record_path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(io_error(&record_path)(e)),
        };

        debug!(
            "Loaded {} transfer record(s) from {}",
            records.len(),
            record_path.display()
        );

        Ok(Self {
            root,
            share_dir: share_dir.into(),
            record_path,
            records,
        })
    }

    /// Directory record paths are relative to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute (root-joined) location of the share directory.
    pub fn share_path(&self) -> PathBuf {
        self.root.join(&self.share_dir)
    }

    /// Location of the JSON snapshot.
    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    /// Filesystem location of a record path.
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Whether a record path lies inside the share directory.
    ///
    /// The snapshot file itself is never shared, even when the share
    /// directory contains it.
    pub fn is_shared(&self, path: &str) -> bool {
        let share_key: Vec<&str> = self
            .share_dir
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect();
        let parts: Vec<&str> = path.split('/').collect();

        parts.len() > share_key.len()
            && parts.starts_with(&share_key)
            && self.resolve(path) != self.record_path
    }

    pub fn get(&self, path: &str) -> Option<&TransferRecord> {
        self.records.get(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `path` has to be sent to the other peer.
    ///
    /// - no record: new file, send it
    /// - completed record: send if the file changed since
    /// - interrupted record: send only if we were the sender
    ///
    /// Directories are never sent.
    pub fn is_unsent(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve(path);
        let metadata = fs::metadata(&full_path).map_err(io_error(&full_path))?;
        if metadata.is_dir() {
            return Ok(false);
        }

        match self.records.get(path) {
            None => Ok(true),
            Some(TransferRecord {
                mtime: Some(recorded),
                ..
            }) => {
                let current = mtime_secs(&metadata).map_err(io_error(&full_path))?;
                Ok(current != *recorded)
            }
            Some(TransferRecord {
                ownership,
                mtime: None,
            }) => Ok(*ownership),
        }
    }

    /// Record that a transfer of `path` is starting.
    ///
    /// Replaces any previous record with one carrying only the ownership flag.
    pub fn set_ownership(&mut self, path: &str, is_owner: bool) -> Result<()> {
        self.records
            .insert(path.to_string(), TransferRecord::pending(is_owner));
        self.save()
    }

    /// Record that the transfer of `path` completed, stamping its current mtime.
    pub fn add_record(&mut self, path: &str) -> Result<()> {
        let full_path = self.resolve(path);
        let metadata = fs::metadata(&full_path).map_err(io_error(&full_path))?;
        let mtime = mtime_secs(&metadata).map_err(io_error(&full_path))?;

        let record = self
            .records
            .get_mut(path)
            .ok_or_else(|| RecorderError::MissingRecord(path.to_string()))?;
        record.mtime = Some(mtime);
        self.save()
    }

    /// Forget `path`. Removing an unknown path is not an error.
    pub fn delete_record(&mut self, path: &str) -> Result<()> {
        self.records.remove(path);
        self.save()
    }

    /// Walk the share directory bottom-up and collect every file that needs sending.
    pub fn get_unsent_files(&self) -> Result<Vec<String>> {
        let share_path = self.share_path();
        if !share_path.exists() {
            debug!("Share directory {} does not exist", share_path.display());
            return Ok(Vec::new());
        }

        let mut unsent = Vec::new();
        for entry in WalkDir::new(&share_path)
            .contents_first(true)
            .sort_by_file_name()
        {
            let entry = entry?;
            let path = self.record_key(entry.path())?;
            if self.is_shared(&path) && self.is_unsent(&path)? {
                unsent.push(path);
            }
        }
        Ok(unsent)
    }

    /// Convert a path under `root` into its `/`-separated record key.
    fn record_key(&self, full_path: &Path) -> Result<String> {
        let relative = full_path.strip_prefix(&self.root).unwrap_or(full_path);

        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(
                    part.to_str()
                        .ok_or_else(|| RecorderError::NonUtf8Path(full_path.to_path_buf()))?,
                ),
                Component::CurDir => {}
                _ => return Err(RecorderError::NonUtf8Path(full_path.to_path_buf())),
            }
        }
        Ok(parts.join("/"))
    }

    /// Atomically replace the snapshot: write a temp file beside it, then rename.
    fn save(&self) -> Result<()> {
        let dir = match self.record_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut temp = NamedTempFile::new_in(dir).map_err(io_error(dir))?;
        serde_json::to_writer(&mut temp, &self.records)?;
        temp.flush().map_err(io_error(temp.path()))?;
        temp.as_file().sync_all().map_err(io_error(temp.path()))?;
        temp.persist(&self.record_path)
            .map_err(|e| io_error(&self.record_path)(e.error))?;
        Ok(())
    }
}
