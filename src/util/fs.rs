//! Filesystem helpers.
//!
//! All helpers wrap OS errors with the offending path. Removal helpers
//! report whether anything was actually removed so callers can track
//! whether an operation did any work.

use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};

/// Ensure a directory (and its parents) exists. Return true if it was
/// created, false if it already existed.
pub fn mkdir(path: &Path) -> Result<bool> {
    if path.is_dir() {
        return Ok(false);
    }
    fs::create_dir_all(path)
        .with_context(|| format!("unable to create directory {}", path.display()))?;
    Ok(true)
}

/// Remove a file. Return true if it existed and was removed.
pub fn rmfile(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => {
            Err(e).with_context(|| format!("unable to remove file {}", path.display()))
        }
    }
}

/// Outcome of removing a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmdirStatus {
    /// The directory was removed.
    Removed,
    /// The directory did not exist.
    NotFound,
    /// The directory is not empty and was left in place.
    NotEmpty,
}

/// Remove a directory if it is empty.
pub fn rmdir(path: &Path) -> Result<RmdirStatus> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(RmdirStatus::Removed),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(RmdirStatus::NotFound),
        Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => Ok(RmdirStatus::NotEmpty),
        // Some platforms report non-empty as a generic error; check directly.
        Err(e) => {
            if path.is_dir() && fs::read_dir(path).map(|mut i| i.next().is_some()).unwrap_or(false)
            {
                return Ok(RmdirStatus::NotEmpty);
            }
            Err(e).with_context(|| format!("unable to remove directory {}", path.display()))
        }
    }
}

/// The modification time of a filesystem entry, or None if it does not
/// exist. Timestamps are the authority on out-of-date-ness.
pub fn mtime(path: &Path) -> Result<Option<SystemTime>> {
    match fs::metadata(path) {
        Ok(m) => {
            let t = m
                .modified()
                .with_context(|| format!("unable to stat {}", path.display()))?;
            Ok(Some(t))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("unable to stat {}", path.display())),
    }
}

/// Check whether a path exists at all.
pub fn exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

/// Read a file to a string.
pub fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("unable to read {}", path.display()))
}

/// Write a string to a file, creating parent directories as needed.
pub fn write(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        mkdir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("unable to write {}", path.display()))
}

/// Lexically normalize a path: resolve `.` and `..` components without
/// touching the filesystem.
pub fn normalize(path: &Path) -> std::path::PathBuf {
    use std::path::Component;

    let mut out = std::path::PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Touch a file: create it empty if missing, update its mtime otherwise.
pub fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        mkdir(parent)?;
    }
    let f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("unable to touch {}", path.display()))?;
    f.set_modified(SystemTime::now())
        .with_context(|| format!("unable to touch {}", path.display()))?;
    Ok(())
}
