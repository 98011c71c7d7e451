use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use thiserror::Error;

/// A file the validator script left in its output directory.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub(crate) struct ResultFile {
    pub(crate) name: String,
    pub(crate) size: u64,
    pub(crate) modified: String,
    pub(crate) is_json: bool,
    #[serde(skip)]
    modified_at: SystemTime,
}

#[derive(Debug, Error)]
pub(crate) enum ResultsError {
    #[error("invalid file name: {0}")]
    InvalidName(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Lists regular files, newest first. A missing directory lists as empty.
pub(crate) async fn list_output_files(dir: &Path) -> io::Result<Vec<ResultFile>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let modified_at = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        files.push(ResultFile {
            is_json: name.ends_with(".json"),
            name,
            size: meta.len(),
            modified: humantime::format_rfc3339_seconds(modified_at).to_string(),
            modified_at,
        });
    }
    files.sort_by(|a, b| {
        b.modified_at
            .cmp(&a.modified_at)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(files)
}

/// Only bare file names are served; anything with a path component is refused.
pub(crate) fn output_file_path(dir: &Path, name: &str) -> Result<PathBuf, ResultsError> {
    let candidate = Path::new(name);
    let is_bare = candidate
        .file_name()
        .map(|file_name| file_name == candidate.as_os_str())
        .unwrap_or(false);
    if !is_bare || name.starts_with('.') {
        return Err(ResultsError::InvalidName(name.to_string()));
    }
    Ok(dir.join(candidate))
}

pub(crate) async fn read_output_file(dir: &Path, name: &str) -> Result<String, ResultsError> {
    let path = output_file_path(dir, name)?;
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(ResultsError::NotFound(name.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

/// Deletes every regular file in the output directory and returns how many were removed.
pub(crate) async fn clean_output_dir(dir: &Path) -> io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}
