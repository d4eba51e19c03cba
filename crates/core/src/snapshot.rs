//! Whole-file snapshot persistence.
//!
//! Snapshots are written to a temporary file in the target directory, synced
//! to disk and then renamed over the target, so a crash at any point leaves
//! either the previous snapshot or the new one on disk.

use std::{
    fs,
    io::Write,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// A typed value persisted as a single JSON file.
#[derive(Debug, Clone)]
pub struct SnapshotFile<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SnapshotFile<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Bind a snapshot to the given path. Nothing is touched on disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and decode the snapshot.
    pub fn load(&self) -> Result<T, StoreError> {
        let content = fs::read(&self.path).map_err(|err| StoreError::io(&self.path, err))?;
        serde_json::from_slice(&content).map_err(|source| StoreError::Decode {
            path: self.path.clone(),
            source,
        })
    }

    /// Read the snapshot, replacing a missing or unreadable file with
    /// `defaults()`. The defaults are persisted before being returned.
    pub fn load_or_else(&self, defaults: impl FnOnce() -> T) -> T {
        match self.load() {
            Ok(value) => value,
            Err(err) => self.recover(&err, defaults),
        }
    }

    /// Replace the snapshot with `defaults()` after `err` failed a load.
    /// The file is not read again.
    pub fn recover(&self, err: &StoreError, defaults: impl FnOnce() -> T) -> T {
        if err.is_not_found() {
            info!(path = %self.path.display(), "snapshot missing, creating defaults");
        } else {
            warn!(path = %self.path.display(), "snapshot unreadable, resetting to defaults: {err}");
        }
        let value = defaults();
        if let Err(err) = self.save(&value) {
            warn!(path = %self.path.display(), "failed to persist defaults: {err}");
        }
        value
    }

    /// Atomically replace the snapshot with `value`.
    pub fn save(&self, value: &T) -> Result<(), StoreError> {
        let serialised = serde_json::to_vec_pretty(value).map_err(StoreError::Encode)?;
        write_atomic(&self.path, &serialised)
    }
}

/// Write `contents` to `path` via a synced temporary file and a rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let staged = stage(path, contents)?;
    commit(staged, path)
}

/// Write `contents` to a synced temporary file next to `path`. The file is
/// removed again if the returned handle is dropped without [`commit`].
pub fn stage(path: &Path, contents: &[u8]) -> Result<NamedTempFile, StoreError> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir).map_err(|err| StoreError::io(dir, err))?;

    let prefix = format!(
        ".{}.",
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string())
    );
    let mut staged = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|err| StoreError::io(dir, err))?;

    staged
        .write_all(contents)
        .and_then(|_| staged.flush())
        .and_then(|_| staged.as_file().sync_all())
        .map_err(|err| StoreError::io(staged.path(), err))?;
    Ok(staged)
}

/// Rename a staged file over `path` and sync the containing directory.
pub fn commit(staged: NamedTempFile, path: &Path) -> Result<(), StoreError> {
    staged
        .persist(path)
        .map_err(|err| StoreError::io(path, err.error))?;
    sync_dir(parent_dir(path));
    debug!(path = %path.display(), "snapshot replaced");
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(err) = fs::File::open(dir).and_then(|handle| handle.sync_all()) {
        debug!(dir = %dir.display(), "directory sync skipped: {err}");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
