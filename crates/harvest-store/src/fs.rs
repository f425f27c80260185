//! File primitives: atomic replace, create-once, JSONL append.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use harvest_core::AppError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub(crate) fn io_error(path: &Path, e: std::io::Error) -> AppError {
    AppError::StorageError(format!("{}: {e}", path.display()))
}

async fn ensure_parent(path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()))
}

async fn write_temp(path: &Path, bytes: &[u8]) -> Result<PathBuf, AppError> {
    ensure_parent(path).await?;
    let tmp = temp_path(path);
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| io_error(&tmp, e))?;
    file.write_all(bytes).await.map_err(|e| io_error(&tmp, e))?;
    file.sync_all().await.map_err(|e| io_error(&tmp, e))?;
    Ok(tmp)
}

/// Replace `path` with `bytes` via temp file + rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    let tmp = write_temp(path, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_error(path, e));
    }
    Ok(())
}

/// Create `path` with `bytes` via temp file + hard link. Never overwrites.
///
/// Returns `Ok(false)` when `path` already exists.
pub(crate) async fn write_new(path: &Path, bytes: &[u8]) -> Result<bool, AppError> {
    let tmp = write_temp(path, bytes).await?;
    let linked = tokio::fs::hard_link(&tmp, path).await;
    let _ = tokio::fs::remove_file(&tmp).await;
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(io_error(path, e)),
    }
}

pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), AppError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

/// `None` when the file does not exist.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, AppError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
            AppError::StorageError(format!("{}: {e}", path.display()))
        })?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path, e)),
    }
}

/// Append one JSON document per line and flush to disk.
pub(crate) async fn append_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<(), AppError> {
    if items.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::new();
    for item in items {
        serde_json::to_writer(&mut buf, item)?;
        buf.push(b'\n');
    }

    ensure_parent(path).await?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| io_error(path, e))?;
    file.write_all(&buf).await.map_err(|e| io_error(path, e))?;
    file.sync_data().await.map_err(|e| io_error(path, e))?;
    Ok(())
}

/// Read a JSONL file. A torn last line (crash mid-append) is skipped.
pub(crate) async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, AppError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(path, e)),
    };

    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut items = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_str(line) {
            Ok(item) => items.push(item),
            Err(_) if i + 1 == lines.len() && !text.ends_with('\n') => {
                tracing::warn!(path = %path.display(), "Skipping torn trailing line");
            }
            Err(e) => {
                return Err(AppError::StorageError(format!(
                    "{} line {}: {e}",
                    path.display(),
                    i + 1
                )));
            }
        }
    }
    Ok(items)
}

/// Files in `dir` with the given extension, sorted by name. Missing dir is empty.
pub(crate) async fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, AppError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(dir, e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(dir, e))? {
        let path = entry.path();
        let hidden = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with('.'));
        if !hidden && path.extension().is_some_and(|ext| ext == extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub(crate) async fn remove_if_exists(path: &Path) -> Result<(), AppError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(path, e)),
    }
}
