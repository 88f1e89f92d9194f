//! Archive of superseded files
//!
//! Files about to be overwritten with different content (or found corrupt)
//! are moved to `archived/` at the dataset root, stamped with their last
//! modification time: `name(YYYY-MM-DD_HH-MM-SS).ext`.

use crate::Result;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Directory under the dataset root holding archived files
pub const ARCHIVE_DIR: &str = "archived";

/// Archived file name for `file_name` last modified at `modified`
pub fn archive_name(file_name: &str, modified: DateTime<Utc>) -> String {
    let stamp = modified.format("%Y-%m-%d_%H-%M-%S");
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}({}).{}", stem, stamp, ext),
        _ => format!("{}({})", file_name, stamp),
    }
}

/// Move `path` into the archive of the dataset rooted at `root`
///
/// Returns the archived location, or `None` if `path` does not exist.
/// A name collision inside the archive gets a `(2)`, `(3)`... suffix.
pub fn send_to_archive(root: &Path, path: &Path) -> Result<Option<PathBuf>> {
    if !path.is_file() {
        return Ok(None);
    }

    let modified: DateTime<Utc> = fs::metadata(path)?.modified()?.into();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let archive_dir = root.join(ARCHIVE_DIR);
    fs::create_dir_all(&archive_dir)?;

    let base = archive_name(&file_name, modified);
    let mut destination = archive_dir.join(&base);
    let mut attempt = 2;
    while destination.exists() {
        destination = archive_dir.join(disambiguate(&base, attempt));
        attempt += 1;
    }

    fs::rename(path, &destination)?;
    info!(from = %path.display(), to = %destination.display(), "Archived file");
    Ok(Some(destination))
}

fn disambiguate(name: &str, attempt: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{}({}).{}", stem, attempt, ext),
        None => format!("{}({})", name, attempt),
    }
}
