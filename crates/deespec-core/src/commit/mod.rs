//! C6: Atomic commit and journal.
//!
//! `state.json` is the single global pointer describing what is happening
//! right now; it must never be observed half-written, so every update goes
//! through a stage-in-temp-then-rename dance with an explicit directory
//! fsync (POSIX guarantees rename is atomic, but not that the directory
//! entry survives a crash without its own fsync). The journal is
//! append-only NDJSON and gets the same fsync-after-write treatment, just
//! without the rename step since appends don't need one.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use deespec_store::models::{JournalEntry, StateSnapshot};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("optimistic concurrency check failed: expected version {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CommitResult<T> = Result<T, CommitError>;

/// Serialize `value` to the stable form required for state.json: sorted
/// keys, two-space indentation, no HTML-escaping, trailing newline. Two
/// snapshots with the same logical content always produce byte-identical
/// output.
///
/// A derived `Serialize` impl emits struct fields in declaration order, not
/// sorted order, so we route through `serde_json::Value` first: its object
/// variant is a `serde_json::Map`, which is a `BTreeMap` as long as the
/// `preserve_order` feature is not enabled, giving sorted keys for free.
/// Only the trailing newline needs adding by hand.
pub fn to_stable_json<T: serde::Serialize>(value: &T) -> CommitResult<String> {
    let value = serde_json::to_value(value)?;
    let mut buf = serde_json::to_string_pretty(&value)?;
    buf.push('\n');
    Ok(buf)
}

/// Commits the global state snapshot to `path` using compare-and-swap on
/// `expected_version`, reading the on-disk value fresh to compare against
/// (the directory is the lock: callers are expected to hold the run-lock
/// or a state-lock before calling this).
pub fn commit_state(path: &Path, expected_version: u64, next: &StateSnapshot) -> CommitResult<()> {
    if let Some(current) = read_state(path)? {
        if current.version != expected_version {
            return Err(CommitError::VersionConflict {
                expected: expected_version,
                found: current.version,
            });
        }
    } else if expected_version != 0 {
        return Err(CommitError::VersionConflict {
            expected: expected_version,
            found: 0,
        });
    }

    write_atomically(path, &to_stable_json(next)?)
}

/// Read the current state snapshot, if the file exists.
pub fn read_state(path: &Path) -> CommitResult<Option<StateSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&data)?))
}

/// Append one journal entry as a single NDJSON line, fsyncing both the file
/// and its parent directory so the append survives a crash.
pub fn append_journal(path: &Path, entry: &JournalEntry) -> CommitResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut line = serde_json::to_string(entry)?;
    line.push('\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.sync_all()?;

    fsync_parent_dir(path)?;
    Ok(())
}

/// Write `contents` to `path` via stage-in-temp, fsync, rename, fsync-dir.
/// Grounded on the same pattern the pack uses for crash-safe config writes:
/// a `NamedTempFile` created alongside the destination so the rename stays
/// on one filesystem, persisted only after its own fsync succeeds.
fn write_atomically(path: &Path, contents: &str) -> CommitResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    fsync_parent_dir(path)?;
    Ok(())
}

#[cfg(unix)]
fn fsync_parent_dir(path: &Path) -> CommitResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let dir = File::open(parent)?;
    dir.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn fsync_parent_dir(_path: &Path) -> CommitResult<()> {
    Ok(())
}

/// Default location for the state snapshot, relative to a run root.
pub fn default_state_path(root: &Path) -> PathBuf {
    root.join("var").join("state.json")
}

/// Default location for the journal, relative to a run root.
pub fn default_journal_path(root: &Path) -> PathBuf {
    root.join("var").join("journal.ndjson")
}
