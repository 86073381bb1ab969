use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Recursively list every regular file under `root` as a
/// `(relative path, absolute path)` pair.
///
/// Relative paths use forward-slash separators regardless of host
/// conventions, so the wire representation is platform-independent.
/// Entries are sorted by file name at each level, making the order
/// deterministic. A missing root or an unreadable entry is skipped with a
/// warning; an empty folder yields an empty list.
pub fn enumerate_folder(root: &Path) -> Vec<(String, PathBuf)> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("skipping unreadable entry under {}: {e}", root.display());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        files.push((rel, entry.path().to_path_buf()));
    }

    files
}
