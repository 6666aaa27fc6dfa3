//! Scan folder fixtures.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Create `<root>/<name>` holding `files` non-empty frames directly in the folder.
///
/// # Errors
///
/// Returns an error when the folder or a file cannot be written.
pub fn write_scan(root: &Path, name: &str, files: usize) -> io::Result<PathBuf> {
    let folder = root.join(name);
    fs::create_dir_all(&folder)?;
    for index in 1..=files {
        write_frame(&folder, name, index)?;
    }
    Ok(folder)
}

/// Create `<root>/<name>` with one sub-directory per `(roll, files)` entry.
///
/// # Errors
///
/// Returns an error when a folder or file cannot be written.
pub fn write_roll_scan(root: &Path, name: &str, rolls: &[(&str, usize)]) -> io::Result<PathBuf> {
    let folder = root.join(name);
    for (roll, files) in rolls {
        let roll_dir = folder.join(roll);
        fs::create_dir_all(&roll_dir)?;
        for index in 1..=*files {
            write_frame(&roll_dir, roll, index)?;
        }
    }
    Ok(folder)
}

/// Add one more frame to an existing folder.
///
/// # Errors
///
/// Returns an error when the file cannot be written.
pub fn add_frame(folder: &Path, index: usize) -> io::Result<PathBuf> {
    let label = folder
        .file_name()
        .map_or_else(String::new, |name| name.to_string_lossy().into_owned());
    write_frame(folder, &label, index)
}

fn write_frame(folder: &Path, label: &str, index: usize) -> io::Result<PathBuf> {
    let path = folder.join(format!("frame_{index:04}.jpg"));
    fs::write(&path, format!("{label} frame {index}").as_bytes())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_frames_for_single_and_multi_roll_scans() -> io::Result<()> {
        let temp = tempfile::tempdir()?;
        let single = write_scan(temp.path(), "roll42", 3)?;
        assert_eq!(fs::read_dir(&single)?.count(), 3);

        let multi = write_roll_scan(temp.path(), "batch", &[("R1", 2), ("R2", 1)])?;
        assert_eq!(fs::read_dir(multi.join("R1"))?.count(), 2);
        assert_eq!(fs::read_dir(multi.join("R2"))?.count(), 1);

        let extra = add_frame(&single, 4)?;
        assert!(extra.ends_with("frame_0004.jpg"));
        Ok(())
    }
}
