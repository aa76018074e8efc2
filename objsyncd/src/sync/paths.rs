use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("object key is empty")]
    Empty,
    #[error("object key contains unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("object key {key} is outside remote prefix {prefix}")]
    OutsidePrefix { key: String, prefix: String },
}

/// Maps ledger paths (object keys) to files under the local sync root.
///
/// A key is `remote_prefix` followed by the file's path relative to `root`,
/// always with `/` separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLayout {
    root: PathBuf,
    remote_prefix: String,
}

impl SyncLayout {
    /// A non-empty `remote_prefix` is treated as a folder and gets a trailing `/`.
    pub fn new(root: impl Into<PathBuf>, remote_prefix: impl Into<String>) -> Self {
        let mut remote_prefix = remote_prefix.into();
        if !remote_prefix.is_empty() && !remote_prefix.ends_with('/') {
            remote_prefix.push('/');
        }
        Self {
            root: root.into(),
            remote_prefix,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn remote_prefix(&self) -> &str {
        &self.remote_prefix
    }

    pub fn key_for(&self, relative_path: &str) -> String {
        format!("{}{}", self.remote_prefix, relative_path)
    }

    pub fn local_path_for(&self, key: &str) -> Result<PathBuf, PathError> {
        let relative = key
            .strip_prefix(self.remote_prefix.as_str())
            .ok_or_else(|| PathError::OutsidePrefix {
                key: key.to_string(),
                prefix: self.remote_prefix.clone(),
            })?;
        local_path_under(&self.root, relative)
    }
}

/// Joins a `/`-separated relative path under `root`, refusing anything that would escape it.
pub fn local_path_under(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.trim_matches('/').is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(relative.to_string()));
            }
        }
    }
    Ok(out)
}

/// Sibling file a download is streamed into before being renamed over the target.
pub fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

pub fn is_partial_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "partial")
}
