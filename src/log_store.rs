//! Per-operation log records on disk.
//!
//! Stores one UTF-8 text file per log id at `<log_dir>/<log_id>.log`.
//! A file is truncated when a run opens it and only appended to while the
//! run lasts. `clear_all` deletes every `.log` file it can and reports the
//! rest instead of failing.
//!
//! A writer holds an exclusive advisory lock on its file (a share-mode
//! restriction on Windows) for as long as it is open. Deletion takes the
//! same lock first, so a log being written is never removed, whether the
//! deleting `LogStore` lives in this process or another one.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Local;
use strum::{Display, EnumString};
use tracing::{debug, info, warn};

use crate::error::{MaintenanceError, PathFailure, Result};

/// File extension for log records.
const LOG_EXTENSION: &str = "log";

/// Timestamp layout at the start of every line.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Reason recorded for a log skipped by `clear_all` because a run holds it.
const IN_USE_REASON: &str = "in use by a running operation";

/// Attempts to open a log whose file keeps being deleted underneath us.
const OPEN_ATTEMPTS: usize = 3;

/// Tag written between the timestamp and the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum LogLevel {
    /// A line produced by the maintenance command itself
    Out,
    Info,
    Warn,
    Error,
}

/// One parsed log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    /// Split `YYYY-MM-DD HH:MM:SS.mmm [TAG] text` back into its parts.
    ///
    /// Returns `None` for lines not written by `LogWriter`.
    pub fn parse(line: &str) -> Option<Self> {
        let open = line.find(" [")?;
        let rest = &line[open + 2..];
        let close = rest.find("] ").or_else(|| rest.strip_suffix(']').map(|s| s.len()))?;
        let level: LogLevel = rest[..close].parse().ok()?;
        let message = rest.get(close + 2..).unwrap_or("");
        Some(Self {
            timestamp: line[..open].to_string(),
            level,
            message: message.to_string(),
        })
    }
}

/// Outcome of `LogStore::clear_all`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClearReport {
    /// Files that were removed.
    pub deleted: Vec<PathBuf>,
    /// Files left in place, with the reason.
    pub skipped: Vec<PathFailure>,
}

impl ClearReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Owner of the logs directory.
///
/// Cheap to clone; clones share the set of log ids that currently have an
/// open write handle.
#[derive(Debug, Clone)]
pub struct LogStore {
    dir: PathBuf,
    active: Arc<Mutex<HashSet<String>>>,
}

impl LogStore {
    /// Create a store rooted at `dir`. Nothing is touched on disk yet.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// `<directory of the running executable>/logs`
    pub fn default_dir() -> std::io::Result<PathBuf> {
        let exe = std::env::current_exe()?;
        let base = exe.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(base.join("logs"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `log_id` (the file may not exist).
    pub fn path_for(&self, log_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", log_id, LOG_EXTENSION))
    }

    /// True while a run holds a write handle for `log_id`.
    pub fn is_active(&self, log_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(log_id)
    }

    /// Create the logs directory if needed and make sure it is writable.
    ///
    /// Idempotent. Fails with an IO error when the executable sits in a
    /// read-only location.
    pub fn ensure_log_directory(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| MaintenanceError::io_at("create log directory", &self.dir, e))?;

        let probe = self.dir.join(".write-probe");
        File::create(&probe)
            .map_err(|e| MaintenanceError::io_at("write to log directory", &self.dir, e))?;
        if let Err(e) = fs::remove_file(&probe) {
            warn!(path = %probe.display(), error = %e, "Failed to remove write probe");
        }

        debug!(dir = %self.dir.display(), "Log directory ready");
        Ok(())
    }

    /// Truncate the record for `log_id` and return a handle for this run.
    ///
    /// The handle flushes and releases the file when dropped, so every exit
    /// path of a run closes it. Fails with `LogInUse` while another writer,
    /// in this process or any other, holds the same record.
    pub fn open_for_write(&self, log_id: &str) -> Result<LogWriter> {
        validate_log_id(log_id)?;
        self.ensure_log_directory()?;

        let newly_active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(log_id.to_string());
        if !newly_active {
            return Err(MaintenanceError::log_in_use(log_id));
        }

        let path = self.path_for(log_id);
        let (file, claim) = match open_claimed(log_id, &path) {
            Ok(opened) => opened,
            Err(e) => {
                self.active
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(log_id);
                return Err(e);
            }
        };

        debug!(log_id, path = %path.display(), "Log opened for write");
        Ok(LogWriter {
            log_id: log_id.to_string(),
            path,
            file: Some(LineWriter::new(file)),
            claim,
            active: Arc::clone(&self.active),
        })
    }

    /// Every line of the record, or an empty list if it does not exist yet.
    pub fn read_all(&self, log_id: &str) -> Result<Vec<String>> {
        validate_log_id(log_id)?;
        let path = self.path_for(log_id);

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MaintenanceError::io_at("read log", &path, e)),
        };

        let mut lines = Vec::new();
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| MaintenanceError::io_at("read log", &path, e))?;
            if n == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        Ok(lines)
    }

    /// Remove the record for one log id.
    ///
    /// Refused with `LogInUse` while a run is writing it. Returns false if
    /// there was nothing to remove.
    pub fn clear(&self, log_id: &str) -> Result<bool> {
        validate_log_id(log_id)?;
        if self.is_active(log_id) {
            return Err(MaintenanceError::log_in_use(log_id));
        }

        let path = self.path_for(log_id);
        match remove_unclaimed(&path) {
            Ok(Removal::Deleted) => {
                info!(log_id, "Cleared log file");
                Ok(true)
            }
            Ok(Removal::Missing) => Ok(false),
            Ok(Removal::InUse) => Err(MaintenanceError::log_in_use(log_id)),
            Err(e) => Err(MaintenanceError::io_at("delete log", &path, e)),
        }
    }

    /// Delete every log file in the directory.
    ///
    /// Each deletion is independent: files held by a running operation, and
    /// files the OS refuses to remove, are listed in `skipped`. Only a
    /// directory that exists but cannot be listed is an error.
    pub fn clear_all(&self) -> Result<ClearReport> {
        let mut report = ClearReport::default();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(MaintenanceError::io_at("list log directory", &self.dir, e)),
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Failed to read log directory entry");
                    report.skipped.push(PathFailure {
                        path: self.dir.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let path = entry.path();
            let is_log = path.extension().is_some_and(|ext| ext == LOG_EXTENSION);
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_log || !is_file {
                continue;
            }

            let active_here = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .is_some_and(|stem| self.is_active(stem));
            let removal = if active_here {
                Ok(Removal::InUse)
            } else {
                remove_unclaimed(&path)
            };

            match removal {
                Ok(Removal::Deleted) => {
                    info!(path = %path.display(), "Cleared log file");
                    report.deleted.push(path);
                }
                Ok(Removal::Missing) => {}
                Ok(Removal::InUse) => {
                    warn!(path = %path.display(), "Log in use by a running operation, skipping");
                    report.skipped.push(PathFailure {
                        path,
                        reason: IN_USE_REASON.to_string(),
                    });
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Error clearing log file");
                    report.skipped.push(PathFailure {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.deleted.sort();
        report.skipped.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(report)
    }
}

/// Open (creating if needed) and lock the record at `path`, then empty it.
///
/// A concurrent `clear` can unlink the file between the open and the lock;
/// the lock would then guard an orphan, so the open is retried.
fn open_claimed(log_id: &str, path: &Path) -> Result<(File, Option<lock::Claim>)> {
    for _ in 0..OPEN_ATTEMPTS {
        let file = match lock::write_options().open(path) {
            Ok(file) => file,
            Err(e) if lock::is_in_use(&e) => return Err(MaintenanceError::log_in_use(log_id)),
            Err(e) => return Err(MaintenanceError::io_at("open log", path, e)),
        };

        let claim = match lock::try_claim(&file) {
            Ok(Some(claim)) => Some(claim),
            Ok(None) => return Err(MaintenanceError::log_in_use(log_id)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Log locking unavailable; writing without it");
                None
            }
        };

        if !lock::still_linked(&file, path) {
            debug!(path = %path.display(), "Log removed while opening, retrying");
            continue;
        }

        // Device files (e.g. a log pointed at /dev/null) cannot be truncated
        let is_regular = file
            .metadata()
            .map_err(|e| MaintenanceError::io_at("open log", path, e))?
            .is_file();
        if is_regular {
            file.set_len(0)
                .map_err(|e| MaintenanceError::io_at("truncate log", path, e))?;
        }
        return Ok((file, claim));
    }

    Err(MaintenanceError::io_at(
        "open log",
        path,
        std::io::Error::other("file was removed repeatedly while opening"),
    ))
}

enum Removal {
    Deleted,
    Missing,
    InUse,
}

/// Delete `path` unless a writer holds its lock.
fn remove_unclaimed(path: &Path) -> std::io::Result<Removal> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Removal::Missing),
        Err(e) => return Err(e),
    };

    // Held until the file is unlinked
    let _claim = match lock::try_claim(&file) {
        Ok(Some(claim)) => Some(claim),
        Ok(None) => return Ok(Removal::InUse),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Could not lock log before deleting");
            None
        }
    };

    match fs::remove_file(path) {
        Ok(()) => Ok(Removal::Deleted),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Removal::Missing),
        Err(e) if lock::is_in_use(&e) => Ok(Removal::InUse),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
mod lock {
    use std::fs::{self, File, OpenOptions};
    use std::os::unix::fs::MetadataExt;
    use std::path::Path;

    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    /// Exclusive `flock` on a duplicate of the log's descriptor. Released
    /// when dropped.
    pub type Claim = Flock<File>;

    pub fn write_options() -> OpenOptions {
        let mut options = OpenOptions::new();
        options.create(true).write(true);
        options
    }

    /// `Ok(None)` when another open file description holds the lock.
    pub fn try_claim(file: &File) -> std::io::Result<Option<Claim>> {
        match Flock::lock(file.try_clone()?, FlockArg::LockExclusiveNonblock) {
            Ok(claim) => Ok(Some(claim)),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(errno.into()),
        }
    }

    /// True when `file` is still the one reachable at `path`.
    pub fn still_linked(file: &File, path: &Path) -> bool {
        match (file.metadata(), fs::metadata(path)) {
            (Ok(open), Ok(named)) => open.dev() == named.dev() && open.ino() == named.ino(),
            _ => false,
        }
    }

    pub fn is_in_use(_err: &std::io::Error) -> bool {
        false
    }
}

#[cfg(not(unix))]
mod lock {
    use std::fs::{File, OpenOptions};
    use std::path::Path;

    /// Writers deny write and delete sharing, so the OS enforces the claim.
    pub type Claim = ();

    #[cfg(windows)]
    pub fn write_options() -> OpenOptions {
        use std::os::windows::fs::OpenOptionsExt;

        const FILE_SHARE_READ: u32 = 0x0000_0001;
        let mut options = OpenOptions::new();
        options.create(true).write(true).share_mode(FILE_SHARE_READ);
        options
    }

    #[cfg(not(windows))]
    pub fn write_options() -> OpenOptions {
        let mut options = OpenOptions::new();
        options.create(true).write(true);
        options
    }

    pub fn try_claim(_file: &File) -> std::io::Result<Option<Claim>> {
        Ok(Some(()))
    }

    pub fn still_linked(_file: &File, _path: &Path) -> bool {
        true
    }

    /// ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
    pub fn is_in_use(err: &std::io::Error) -> bool {
        cfg!(windows) && matches!(err.raw_os_error(), Some(32) | Some(33))
    }
}

/// Log ids become file names; keep them to a single plain path component.
fn validate_log_id(log_id: &str) -> Result<()> {
    let valid = !log_id.is_empty()
        && log_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(MaintenanceError::io(
            format!("Invalid log id '{}'", log_id),
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        ))
    }
}

/// Write handle for one run's log record.
///
/// Lines are flushed as they are written so a viewer can tail the file.
pub struct LogWriter {
    log_id: String,
    path: PathBuf,
    file: Option<LineWriter<File>>,
    /// Released only after the final flush
    claim: Option<lock::Claim>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogWriter")
            .field("log_id", &self.log_id)
            .field("path", &self.path)
            .field("open", &self.file.is_some())
            .field("locked", &self.claim.is_some())
            .finish()
    }
}

impl LogWriter {
    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line.
    pub fn append(&mut self, level: LogLevel, message: &str) -> std::io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(std::io::Error::other("log writer already finished"));
        };
        let timestamp = Local::now().format(TIMESTAMP_FORMAT);
        writeln!(file, "{} [{}] {}", timestamp, level, message)
    }

    /// Flush to stable storage and release the file.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.close()
    }

    fn close(&mut self) -> std::io::Result<()> {
        let result = match self.file.take() {
            Some(mut file) => file.flush().and_then(|()| file.get_ref().sync_all()),
            None => Ok(()),
        };
        self.claim = None;
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.log_id);
        result
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(log_id = %self.log_id, error = %e, "Failed to flush log on release");
        }
    }
}
