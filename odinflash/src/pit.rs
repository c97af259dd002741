//! Partition table (PIT) handling.
//!
//! The core deliberately does not parse PIT structure; it only decides
//! whether a blob read back from a device is plausible enough to keep, and
//! where to archive it. Structural parsing belongs to downstream tooling.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::info;

use crate::error::{Error, Result};

/// Minimum byte length of a plausible PIT blob.
pub const PIT_MIN_LEN: usize = 20;

/// How many leading bytes must contain at least one non-zero value.
const SCAN_PREFIX_LEN: usize = 100;

/// Timestamp format used in backup file names.
const BACKUP_STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Sanity-check a candidate PIT blob.
///
/// Accepts iff the blob is at least [`PIT_MIN_LEN`] bytes and its first 100
/// bytes are not all zero. Devices that refuse a dump pad the line with
/// zeroes, which this filters out without a structural parse.
pub fn is_plausible_pit(blob: &[u8]) -> bool {
    blob.len() >= PIT_MIN_LEN
        && blob[..blob.len().min(SCAN_PREFIX_LEN)]
            .iter()
            .any(|&b| b != 0)
}

/// Validate a blob, turning a rejection into [`Error::PitInvalid`].
pub fn ensure_plausible_pit(blob: &[u8]) -> Result<()> {
    if is_plausible_pit(blob) {
        Ok(())
    } else if blob.len() < PIT_MIN_LEN {
        Err(Error::PitInvalid(format!(
            "{} bytes is below the {PIT_MIN_LEN}-byte floor",
            blob.len()
        )))
    } else {
        Err(Error::PitInvalid(
            "leading bytes are all zero".to_string(),
        ))
    }
}

/// Backup file path for a PIT read at `stamp` under the given base.
pub fn backup_path(base: &Path, stamp: &DateTime<Local>) -> PathBuf {
    base.join("backup")
        .join("samsung")
        .join("pit")
        .join(format!("{}.pit", stamp.format(BACKUP_STAMP_FORMAT)))
}

/// Archive a PIT blob under `<base>/backup/samsung/pit/<timestamp>.pit`.
pub fn write_backup(base: &Path, blob: &[u8]) -> Result<PathBuf> {
    ensure_plausible_pit(blob)?;
    let path = backup_path(base, &Local::now());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, blob)?;
    info!("PIT backup written to {}", path.display());
    Ok(path)
}
