//! Rolling snapshot directories
//!
//! Continuous backups write each run into a fresh directory named after the
//! local time it started (`2024-05-01-13-45-00`). Before a new snapshot is
//! created the oldest ones are removed so that at most `max_backups` remain.

use chrono::{Local, NaiveDateTime};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{BackupError, Result};

/// Snapshot directory name format; sorts lexically in time order
pub const SNAPSHOT_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// An existing snapshot directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub path: PathBuf,
    pub taken_at: NaiveDateTime,
}

/// Rotate `parent` and create the next snapshot directory for the current time
pub fn rolling_dir(parent: &Path, max_backups: usize) -> Result<PathBuf> {
    rolling_dir_at(parent, max_backups, Local::now().naive_local())
}

/// Rotate `parent` and create the snapshot directory for `now`
///
/// Deletion failures abort before the new directory is created.
pub fn rolling_dir_at(parent: &Path, max_backups: usize, now: NaiveDateTime) -> Result<PathBuf> {
    rotate(parent, max_backups, now, |path| fs::remove_dir_all(path))
}

fn rotate<F>(parent: &Path, max_backups: usize, now: NaiveDateTime, mut remove: F) -> Result<PathBuf>
where
    F: FnMut(&Path) -> io::Result<()>,
{
    let max_backups = if max_backups < 1 {
        warn!("max backups must be at least 1, using 1");
        1
    } else {
        max_backups
    };

    fs::create_dir_all(parent)
        .map_err(|e| BackupError::io("Failed to create backup directory", parent, e))?;

    let snapshots = list_snapshots(parent)?;
    let over_limit = (snapshots.len() + 1).saturating_sub(max_backups);

    if over_limit > 0 {
        info!(
            "Found {} snapshots with a limit of {}, removing the {} oldest",
            snapshots.len(),
            max_backups,
            over_limit
        );
    }

    for snapshot in snapshots.iter().take(over_limit) {
        info!("Removing old snapshot {}", snapshot.path.display());
        remove(&snapshot.path)
            .map_err(|e| BackupError::io("Failed to remove old snapshot", &snapshot.path, e))?;
    }

    let next = parent.join(now.format(SNAPSHOT_FORMAT).to_string());
    fs::create_dir(&next)
        .map_err(|e| BackupError::io("Failed to create snapshot directory", &next, e))?;

    info!("Created snapshot directory {}", next.display());
    Ok(next)
}

/// Snapshot directories under `parent`, oldest first
///
/// Files and directories whose names aren't snapshot timestamps are skipped.
pub fn list_snapshots(parent: &Path) -> Result<Vec<Snapshot>> {
    let entries = fs::read_dir(parent)
        .map_err(|e| BackupError::io("Failed to read backup directory", parent, e))?;

    let mut snapshots = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| BackupError::io("Failed to read backup directory", parent, e))?;
        let path = entry.path();

        if !path.is_dir() {
            debug!("Skipping non-directory entry {}", path.display());
            continue;
        }

        let name = entry.file_name();
        match NaiveDateTime::parse_from_str(&name.to_string_lossy(), SNAPSHOT_FORMAT) {
            Ok(taken_at) => snapshots.push(Snapshot { path, taken_at }),
            Err(_) => debug!("Skipping directory {} (not a snapshot)", path.display()),
        }
    }

    snapshots.sort_by_key(|s| s.taken_at);
    Ok(snapshots)
}
