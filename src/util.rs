use std::env;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::SyncError;

pub use fnv::{FnvHashMap, FnvHashSet};

/// Makes `path` absolute against the current directory and folds away `.`
/// and `..` lexically, without touching the filesystem.
pub fn absolute(path: &Path) -> io::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // popping past the filesystem root leaves it in place
                normalized.pop();
            }
            Component::Normal(name) => normalized.push(name),
        }
    }
    Ok(normalized)
}

/// The direct parent of an already normalized absolute path. The filesystem
/// root is its own parent.
pub fn parent_directory(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| path.to_path_buf())
}

/// Normalizes a root-relative entry path to the POSIX form used as record key:
/// leading `/`, no empty or trailing segments, `/` for the root itself.
pub fn normalize_entry_path(raw: &str) -> Result<String, SyncError> {
    let replaced = raw.replace('\\', "/");
    let mut segments = Vec::new();
    for segment in replaced.split('/') {
        match segment {
            "" => continue,
            "." | ".." => return Err(SyncError::InvalidPath(raw.to_owned())),
            name => segments.push(name),
        }
    }
    if segments.is_empty() {
        Ok("/".to_owned())
    } else {
        Ok(format!("/{}", segments.join("/")))
    }
}

/// Converts an absolute filesystem path below `root` into an entry path.
pub fn entry_path_for(root: &Path, absolute: &Path) -> Result<String, SyncError> {
    let relative = absolute
        .strip_prefix(root)
        .map_err(|_| SyncError::InvalidPath(absolute.to_string_lossy().into_owned()))?;
    let mut segments = Vec::new();
    for component in relative.components() {
        match component.as_os_str().to_str() {
            Some(name) => segments.push(name),
            None => return Err(SyncError::InvalidPath(relative.to_string_lossy().into_owned())),
        }
    }
    normalize_entry_path(&segments.join("/"))
}

/// The filesystem location of an entry path inside `root`.
pub fn filesystem_path(root: &Path, entry_path: &str) -> PathBuf {
    let relative = entry_path.trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

/// The last segment of an entry path (empty for the root).
pub fn base_name(entry_path: &str) -> &str {
    match entry_path.rfind('/') {
        Some(i) => &entry_path[i + 1..],
        None => entry_path,
    }
}
