//! Quarantine store for conflicting destination files.
//!
//! Follows the move-then-recreate idiom common to conflict-safe backup
//! writers: never overwrite a file that might be evidence of a real
//! conflict, move it aside instead.

use chrono::Local;
use std::io;
use std::path::{Path, PathBuf};

pub const QUARANTINE_DIR_NAME: &str = ".imageintact_quarantine";

/// Moves `target` into `<destination_root>/.imageintact_quarantine/<basename>_<YYYYMMDD_HHMMSS>.<ext>`,
/// creating the quarantine directory on demand. Returns the quarantine path.
///
/// The quarantine directory is hidden and never pruned by the engine.
pub fn quarantine_file(destination_root: &Path, target: &Path) -> io::Result<PathBuf> {
    let quarantine_dir = destination_root.join(QUARANTINE_DIR_NAME);
    std::fs::create_dir_all(&quarantine_dir)?;
    hide_directory(&quarantine_dir);

    let quarantine_path = quarantine_path_for(&quarantine_dir, target);
    std::fs::rename(target, &quarantine_path)?;
    Ok(quarantine_path)
}

fn quarantine_path_for(quarantine_dir: &Path, target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = target.extension().and_then(|e| e.to_str());
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");

    let file_name = match ext {
        Some(ext) => format!("{stem}_{timestamp}.{ext}"),
        None => format!("{stem}_{timestamp}"),
    };
    quarantine_dir.join(file_name)
}

/// Best-effort "hide from file browsers" flag. On Unix the leading dot in
/// [`QUARANTINE_DIR_NAME`] already achieves this; platforms with a distinct
/// hidden-attribute API would set it here.
#[cfg(unix)]
fn hide_directory(_path: &Path) {}

#[cfg(not(unix))]
fn hide_directory(_path: &Path) {}
