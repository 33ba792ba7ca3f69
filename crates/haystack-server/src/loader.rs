//! Record file loading
//!
//! A record file is a `.json` array of Haystack JSON dicts, each with an
//! `id` tag.

use std::path::{Path, PathBuf};

use haystack::Dict;
use thiserror::Error;

use crate::core::ServerCore;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("blocking task failed: {0}")]
    Task(String),
}

/// Read the records of one file (sync)
pub fn load_file_sync(path: &Path) -> Result<Vec<Dict>, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Read the records of one file (async, runs on blocking thread pool)
pub async fn load_file(path: &Path) -> Result<Vec<Dict>, LoadError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || load_file_sync(&path))
        .await
        .map_err(|e| LoadError::Task(e.to_string()))?
}

/// Check if a file looks like a record file
pub fn is_supported_file(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("json"))
}

/// Collect all record files from paths (files or directories)
pub fn collect_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            if let Ok(entries) = std::fs::read_dir(path) {
                for entry in entries.flatten() {
                    let p = entry.path();
                    if p.is_file() && is_supported_file(&p) {
                        files.push(p);
                    }
                }
            }
        } else if path.is_file() && is_supported_file(path) {
            files.push(path.clone());
        }
    }
    files.sort();
    files
}

/// Load every record file under `paths` into the server.
///
/// Files that fail to load are logged and skipped. Returns the number of
/// records committed.
pub async fn load_into(core: &ServerCore, paths: &[PathBuf]) -> usize {
    let mut total = 0;
    for path in collect_files(paths) {
        let records = match load_file(&path).await {
            Ok(records) => records,
            Err(e) => {
                log::warn!("Failed to load {}", e);
                continue;
            }
        };
        let count = records.len();
        match core.commit(records).await {
            Ok(_) => {
                log::info!("Loaded {} records from {}", count, path.display());
                total += count;
            }
            Err(e) => log::warn!("Failed to commit {}: {}", path.display(), e),
        }
    }
    total
}
