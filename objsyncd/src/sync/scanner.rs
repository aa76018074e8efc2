use std::path::{Path, PathBuf};

use thiserror::Error;
use time::OffsetDateTime;
use walkdir::WalkDir;

use super::paths::is_partial_file;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("sync root is not a readable directory: {0}")]
    RootUnavailable(PathBuf),
    #[error("failed to read sync root {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A regular file found under the sync root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// Path relative to the root, `/`-separated.
    pub relative_path: String,
    pub mod_time: i64,
    pub size: i64,
}

/// Recursively lists regular files under `root`.
///
/// Entries that cannot be read are skipped; only an unusable root is an error,
/// because an empty result would otherwise read as "everything was deleted".
pub fn scan_local_tree(root: &Path) -> Result<Vec<LocalFile>, ScanError> {
    let meta = std::fs::metadata(root).map_err(|source| ScanError::Root {
        path: root.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(ScanError::RootUnavailable(root.to_path_buf()));
    }
    std::fs::read_dir(root).map_err(|source| ScanError::Root {
        path: root.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| match e {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::debug!(error = %err, "skipping unreadable entry");
                None
            }
        })
    {
        if !entry.file_type().is_file() || is_partial_file(entry.path()) {
            continue;
        }
        let Some(relative_path) = relative_key(root, entry.path()) else {
            continue;
        };
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                tracing::debug!(path = %entry.path().display(), error = %err, "skipping unreadable file");
                continue;
            }
        };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        files.push(LocalFile {
            relative_path,
            mod_time: system_time_nanos(modified),
            size: i64::try_from(meta.len()).unwrap_or(i64::MAX),
        });
    }
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

pub fn system_time_nanos(value: std::time::SystemTime) -> i64 {
    let nanos = OffsetDateTime::from(value).unix_timestamp_nanos();
    i64::try_from(nanos).unwrap_or(if nanos < 0 { i64::MIN } else { i64::MAX })
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
