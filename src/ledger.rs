//! Shared ledger file.
//!
//! Every append rewrites the whole file: take the ledger lock, read the
//! current contents, write contents plus the new row into a sibling temp file,
//! fsync it and rename it over the ledger. Readers therefore only ever see the
//! old file or the new one.
//!
//! The lock lives in a sidecar `<ledger>.lock` file rather than on the ledger
//! itself. The rename swaps the ledger's inode, so a lock taken on the ledger
//! would not be seen by a writer that opens the path after the swap.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use rust_decimal::Decimal;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::types::{format_amount, BranchResult};

pub const DEFAULT_HEADER: &str = "ts,branch,records,subtotal,ts2\n";

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// One ledger row.
///
/// `received_at` and `logged_at` always hold the same instant; both columns
/// are kept so existing readers of the five-column layout keep working.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerEntry {
    pub received_at: DateTime<Utc>,
    pub branch_id: String,
    pub record_count: u64,
    pub subtotal: Decimal,
    pub logged_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(result: &BranchResult, at: DateTime<Utc>) -> Self {
        Self {
            received_at: at,
            branch_id: result.branch_id.clone(),
            record_count: result.record_count,
            subtotal: result.subtotal,
            logged_at: at,
        }
    }

    pub fn to_row(&self) -> String {
        format!(
            "{},{},{},{},{}\n",
            format_timestamp(&self.received_at),
            self.branch_id,
            self.record_count,
            format_amount(self.subtotal),
            format_timestamp(&self.logged_at)
        )
    }

    fn parse_row(line: &str) -> Option<Self> {
        let mut columns = line.trim_end().split(',');
        let entry = Self {
            received_at: columns.next()?.parse().ok()?,
            branch_id: columns.next().filter(|id| !id.is_empty())?.to_string(),
            record_count: columns.next()?.parse().ok()?,
            subtotal: Decimal::from_str(columns.next()?).ok()?,
            logged_at: columns.next()?.parse().ok()?,
        };
        match columns.next() {
            Some(_) => None,
            None => Some(entry),
        }
    }
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Appends rows to one ledger path. Cheap to clone; holds no open handles.
#[derive(Clone, Debug)]
pub struct LedgerWriter {
    path: PathBuf,
}

impl LedgerWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the ledger with `header` if it does not exist yet. Returns
    /// whether a new file was written.
    pub fn initialize(&self, header: &str) -> Result<bool, LedgerError> {
        self.initialize_inner(header, None)
    }

    /// [`initialize`](Self::initialize), giving up if the ledger lock is not
    /// free by `deadline`.
    pub fn initialize_before(
        &self,
        header: &str,
        deadline: Instant,
    ) -> Result<bool, LedgerError> {
        self.initialize_inner(header, Some(deadline))
    }

    fn initialize_inner(
        &self,
        header: &str,
        deadline: Option<Instant>,
    ) -> Result<bool, LedgerError> {
        let lock = self.lock(deadline)?;
        if self.path.exists() {
            return Ok(false);
        }
        let staged = self.stage(&lock, header.as_bytes(), b"", None)?;
        staged.commit()?;
        info!(path = ?self.path, "Created ledger");
        Ok(true)
    }

    pub fn append(&self, result: &BranchResult) -> Result<LedgerEntry, LedgerError> {
        self.append_at(result, Utc::now())
    }

    pub fn append_at(
        &self,
        result: &BranchResult,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.write_row(result, at, None)
    }

    /// Append unless the ledger lock stays held past `deadline`, in which
    /// case nothing is written and [`LedgerError::LockTimedOut`] is returned.
    pub fn append_before(
        &self,
        result: &BranchResult,
        deadline: Instant,
    ) -> Result<LedgerEntry, LedgerError> {
        self.write_row(result, Utc::now(), Some(deadline))
    }

    fn write_row(
        &self,
        result: &BranchResult,
        at: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<LedgerEntry, LedgerError> {
        if !self.path.exists() {
            return Err(LedgerError::Missing {
                path: self.path.clone(),
            });
        }

        let entry = LedgerEntry::new(result, at);
        let lock = self.lock(deadline)?;
        let current = self.read_current()?;
        let permissions = fs::metadata(&self.path).ok().map(|m| m.permissions());
        let staged = self.stage(&lock, &current, entry.to_row().as_bytes(), permissions)?;
        staged.commit()?;
        drop(lock);

        debug!(
            path = ?self.path,
            branch = %entry.branch_id,
            bytes = current.len(),
            "Appended ledger row"
        );
        Ok(entry)
    }

    // Without a deadline this blocks until the lock is free
    fn lock(&self, deadline: Option<Instant>) -> Result<LedgerLock, LedgerError> {
        let lock_path = sidecar(&self.path, "lock");
        let lock_err = |source: io::Error| LedgerError::Lock {
            path: lock_path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(lock_err)?;

        let Some(deadline) = deadline else {
            FileExt::lock_exclusive(&file).map_err(lock_err)?;
            return Ok(LedgerLock { file });
        };
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(LedgerLock { file }),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LedgerError::LockTimedOut {
                            path: lock_path.clone(),
                        });
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL.min(deadline - now));
                }
                Err(source) => return Err(lock_err(source)),
            }
        }
    }

    fn read_current(&self) -> Result<Vec<u8>, LedgerError> {
        fs::read(&self.path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => LedgerError::Missing {
                path: self.path.clone(),
            },
            _ => LedgerError::Read {
                path: self.path.clone(),
                source,
            },
        })
    }

    // Writes and fsyncs the next ledger version without touching the ledger
    fn stage(
        &self,
        _lock: &LedgerLock,
        current: &[u8],
        row: &[u8],
        permissions: Option<fs::Permissions>,
    ) -> Result<StagedLedger, LedgerError> {
        let dir = parent_dir(&self.path);
        let mut temp = NamedTempFile::new_in(&dir).map_err(|source| LedgerError::TempFile {
            path: self.path.clone(),
            source,
        })?;

        let write_err = |source: io::Error| LedgerError::Write {
            path: temp_path_for(&self.path),
            source,
        };
        if let Some(permissions) = permissions {
            temp.as_file().set_permissions(permissions).map_err(write_err)?;
        }
        temp.write_all(current).map_err(write_err)?;
        // Never glue a row onto an unterminated last line
        if !row.is_empty() && current.last().is_some_and(|&b| b != b'\n') {
            temp.write_all(b"\n").map_err(write_err)?;
        }
        temp.write_all(row).map_err(write_err)?;
        temp.as_file().sync_all().map_err(write_err)?;

        Ok(StagedLedger {
            temp,
            target: self.path.clone(),
            dir,
        })
    }
}

// Held for the whole read-stage-rename critical section
struct LedgerLock {
    file: File,
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// A fully written, durable next version of the ledger awaiting its rename.
struct StagedLedger {
    temp: NamedTempFile,
    target: PathBuf,
    dir: PathBuf,
}

impl StagedLedger {
    fn commit(self) -> Result<(), LedgerError> {
        let target = self.target;
        self.temp
            .persist(&target)
            .map_err(|err| LedgerError::Rename {
                path: target.clone(),
                source: err.error,
            })?;

        // Make the rename itself durable
        #[cfg(unix)]
        {
            if let Ok(dir) = File::open(&self.dir) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

/// Read every row back, skipping a header line if present.
pub fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
    let contents = fs::read_to_string(path).map_err(|source| LedgerError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match LedgerEntry::parse_row(line) {
            Some(entry) => entries.push(entry),
            None if idx == 0 => {}
            None => {
                return Err(LedgerError::Corrupt {
                    path: path.to_path_buf(),
                    line: idx + 1,
                })
            }
        }
    }
    Ok(entries)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn sidecar(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(extension);
    path.with_file_name(name)
}

// Only used for error reporting; the real temp name is randomized
fn temp_path_for(path: &Path) -> PathBuf {
    sidecar(path, "tmp")
}
