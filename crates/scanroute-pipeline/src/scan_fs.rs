//! Filesystem helpers shared by the detector and the uploader.
//!
//! # Design
//! - One eligibility rule for both the stability fingerprint and the upload set.
//! - Sub-directories are rolls; loose files in the scan folder form a roll
//!   named after the folder itself, renamed when a sub-directory already
//!   holds that name.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use scanroute_core::{FolderSnapshot, RollKind, RollLayout, folder_name};
use walkdir::{DirEntry, WalkDir};

const JUNK_FILES: [&str; 3] = [".DS_Store", "Thumbs.db", "desktop.ini"];

/// A file that belongs to a roll, with its path relative to the roll folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollFile {
    /// Absolute path on disk.
    pub path: PathBuf,
    /// `/`-separated path below the roll folder.
    pub relative: String,
    /// Size in bytes when listed.
    pub size: u64,
}

/// Whether a file or directory name is excluded from scans.
#[must_use]
pub fn is_ignored_name(name: &str) -> bool {
    name.starts_with('.') || JUNK_FILES.iter().any(|junk| junk.eq_ignore_ascii_case(name))
}

fn entry_is_visible(entry: &DirEntry) -> bool {
    entry.depth() == 0 || !is_ignored_name(&entry.file_name().to_string_lossy())
}

/// Fingerprint the eligible files below `folder`.
///
/// # Errors
///
/// Returns an error when the folder cannot be walked (for example, it was deleted).
pub fn snapshot(folder: &Path) -> io::Result<FolderSnapshot> {
    let mut snapshot = FolderSnapshot::default();
    for entry in WalkDir::new(folder).into_iter().filter_entry(entry_is_visible) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata().map_err(io::Error::from)?;
        if metadata.len() == 0 {
            continue;
        }
        snapshot.file_count += 1;
        snapshot.total_bytes += metadata.len();
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        if modified > snapshot.newest_modified {
            snapshot.newest_modified = modified;
        }
    }
    Ok(snapshot)
}

/// Scan folders below `root` at `depth` (1: `<root>/<scan>`, 2: `<root>/<day>/<scan>`).
///
/// # Errors
///
/// Returns an error when the root cannot be read.
pub fn discover_scan_folders(root: &Path, depth: usize) -> io::Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "watch root missing"));
    }
    let mut folders: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(depth)
        .max_depth(depth)
        .into_iter()
        .filter_entry(entry_is_visible)
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_dir())
        .map(DirEntry::into_path)
        .collect();
    folders.sort();
    Ok(folders)
}

/// Rolls of a scan folder, in upload order.
///
/// Loose files come first as the folder-named roll, then each non-empty
/// sub-directory in name order. When a sub-directory already carries the
/// folder's name, the loose roll becomes `<name>-loose` (or `<name>-loose-2`,
/// and so on) so the two never share an identifier or a destination.
///
/// # Errors
///
/// Returns an error when the folder cannot be read.
pub fn roll_layout(folder: &Path) -> io::Result<RollLayout> {
    let mut entries = BTreeSet::new();
    let mut sub_rolls = Vec::new();
    let mut has_loose_files = false;
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        entries.insert(name.clone());
        if is_ignored_name(&name) {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if !snapshot(&entry.path())?.is_empty() {
                sub_rolls.push(name);
            }
        } else if file_type.is_file() && entry.metadata()?.len() > 0 {
            has_loose_files = true;
        }
    }

    let loose_roll = has_loose_files.then(|| loose_roll_id(&folder_name(folder), &entries));
    sub_rolls.sort();
    let rolls = loose_roll.iter().cloned().chain(sub_rolls).collect();
    Ok(RollLayout { rolls, loose_roll })
}

fn loose_roll_id(base: &str, taken: &BTreeSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    let mut candidate = format!("{base}-loose");
    let mut suffix = 2;
    while taken.contains(&candidate) {
        candidate = format!("{base}-loose-{suffix}");
        suffix += 1;
    }
    candidate
}

/// Eligible files of one roll, sorted by relative path.
///
/// A [`RollKind::Loose`] roll lists the files directly in `folder`; a
/// [`RollKind::Directory`] roll walks `folder/roll_id` recursively.
///
/// # Errors
///
/// Returns [`io::ErrorKind::NotFound`] when the folder backing the roll is
/// missing, or any walk failure.
pub fn roll_files(folder: &Path, roll_id: &str, kind: RollKind) -> io::Result<Vec<RollFile>> {
    let (root, max_depth) = match kind {
        RollKind::Loose => (folder.to_path_buf(), 1),
        RollKind::Directory => (folder.join(roll_id), usize::MAX),
    };
    if !root.is_dir() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "roll folder missing"));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(&root)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(entry_is_visible)
    {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry.metadata().map_err(io::Error::from)?.len();
        if size == 0 {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(&root)
            .map_err(io::Error::other)?
            .components()
            .map(|part| part.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push(RollFile {
            path: entry.into_path(),
            relative,
            size,
        });
    }
    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}
