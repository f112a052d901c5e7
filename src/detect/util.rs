use std::path::Path;
use walkdir::WalkDir;

use crate::config::Ignore;
use crate::error::SyncError;
use crate::util::entry_path_for;

/// checks if the entry path is on the ignore list
pub fn is_ignored(ignore: &Ignore, path: &str) -> bool {
    for prefix in &ignore.paths {
        let prefix = prefix.trim_end_matches('/');
        if path == prefix || path.starts_with(&format!("{}/", prefix)) {
            return true;
        }
    }
    for regex in &ignore.regexes {
        if regex.is_match(path) {
            return true;
        }
    }
    false
}

/// The result of walking a root.
#[derive(Debug, Default)]
pub struct EntryScan {
    pub paths: Vec<String>,
    /// Entries that could not be read or named, with a best-effort entry path.
    pub skipped: Vec<(String, SyncError)>,
}

/// Lists every entry path below `root` (the root itself included, as `/`),
/// skipping ignored entries and everything inside ignored folders.
///
/// Only a failure to read the root itself is an error. Unreadable entries
/// and names that are not valid UTF-8 are reported in `skipped`, and folders
/// among them are not descended into.
pub fn scan_entry_paths(root: &Path, ignore: &Ignore) -> Result<EntryScan, SyncError> {
    let mut scan = EntryScan::default();
    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| match entry_path_for(root, entry.path()) {
            Ok(path) => {
                let ignored = is_ignored(ignore, &path);
                if ignored {
                    info!("Ignoring entry {:?}", path);
                }
                !ignored
            }
            Err(_) => true,
        });

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.depth() == 0 {
                    return Err(e.into());
                }
                let location = e
                    .path()
                    .map(|path| lossy_entry_path(root, path))
                    .unwrap_or_default();
                warn!("Skipping {:?}: {}", location, e);
                scan.skipped.push((location, e.into()));
                continue;
            }
        };
        match entry_path_for(root, entry.path()) {
            Ok(path) => {
                trace!("Found entry {:?}", path);
                scan.paths.push(path);
            }
            Err(e) => {
                let location = lossy_entry_path(root, entry.path());
                warn!("Skipping {:?}: {}", location, e);
                scan.skipped.push((location, e));
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
            }
        }
    }
    Ok(scan)
}

fn lossy_entry_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    format!("/{}", relative.to_string_lossy().trim_start_matches('/'))
}
