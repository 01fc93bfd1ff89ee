//! Disk usage of project working directories.

use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::registry::Project;

/// Size of one project's working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub name: String,
    pub workdir: PathBuf,
    /// Total size of regular files, `None` when the directory is missing.
    pub bytes: Option<u64>,
}

/// Measures the working directory of every project. This walks whole trees,
/// so callers on the async runtime should run it on a blocking thread.
pub fn measure(projects: &[Project]) -> Vec<DiskUsage> {
    projects
        .iter()
        .map(|project| DiskUsage {
            name: project.name.clone(),
            workdir: project.workdir.clone(),
            bytes: dir_size(&project.workdir),
        })
        .collect()
}

/// Sums file sizes below `path` without following symlinks. Entries that
/// cannot be read are skipped.
pub fn dir_size(path: &Path) -> Option<u64> {
    if !path.is_dir() {
        return None;
    }
    let total = WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum();
    Some(total)
}

/// Formats a byte count with binary units, e.g. `1.50 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("b.txt"), vec![0u8; 24]).unwrap();
        assert_eq!(dir_size(dir.path()), Some(124));
        assert_eq!(dir_size(&dir.path().join("missing")), None);
    }

    #[test]
    fn formats_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
