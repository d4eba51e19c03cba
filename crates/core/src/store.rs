//! Cached, versioned store over the root [`Document`].
//!
//! Reads are served from an in-process copy while it is younger than the
//! freshness window; writes replace the backing snapshot atomically and
//! refresh that copy. Plain [`SnapshotStore::read`] / [`SnapshotStore::write`]
//! give callers no isolation from each other: two interleaved
//! read-modify-write cycles lose one of the updates. [`SnapshotStore::update`]
//! serialises the whole cycle and is what the shop operations use.

use std::{
    path::Path,
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use tracing::{error, info};

use crate::{
    config::AppConfig, document::Document, error::StoreError, snapshot::SnapshotFile,
};

/// Default time a cached document is served without touching disk.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(30);

struct Cached {
    document: Document,
    loaded_at: Instant,
}

/// Process-wide owner of the backing snapshot and its cache.
pub struct SnapshotStore {
    file: SnapshotFile<Document>,
    freshness: Duration,
    defaults: Document,
    cache: RwLock<Option<Cached>>,
    writer: Mutex<()>,
}

impl SnapshotStore {
    /// Create a cold store over `path`. Nothing is read until first use.
    pub fn open(path: impl AsRef<Path>, freshness: Duration) -> Self {
        Self {
            file: SnapshotFile::new(path.as_ref()),
            freshness,
            defaults: Document::default(),
            cache: RwLock::new(None),
            writer: Mutex::new(()),
        }
    }

    /// Store configured from the application settings, seeding the admins
    /// into the default skeleton.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::open(&config.data_file, config.freshness())
            .with_defaults(Document::with_admins(config.admins.iter().copied()))
    }

    /// Replace the skeleton used when the backing file is missing or corrupt.
    pub fn with_defaults(mut self, defaults: Document) -> Self {
        self.defaults = defaults;
        self
    }

    /// Location of the backing snapshot.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Configured freshness window.
    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Return a private copy of the document.
    ///
    /// The cached copy is used unless `force_refresh` is set or it has
    /// outlived the freshness window. A missing or unreadable snapshot is
    /// replaced by the default skeleton, so this never fails.
    pub fn read(&self, force_refresh: bool) -> Document {
        if !force_refresh {
            if let Some(cached) = self.cache.read().as_ref() {
                if cached.loaded_at.elapsed() < self.freshness {
                    return cached.document.clone();
                }
            }
        }

        let document = self.load();
        self.remember(document.clone());
        document
    }

    /// Persist `document`, returning `false` if it did not reach disk.
    pub fn write(&self, document: &Document) -> bool {
        match self.try_write(document) {
            Ok(()) => true,
            Err(err) => {
                error!(path = %self.path().display(), "failed to save document: {err}");
                false
            }
        }
    }

    /// Persist `document`, surfacing the failure to the caller.
    pub fn try_write(&self, document: &Document) -> Result<(), StoreError> {
        self.file.save(document)?;
        self.remember(document.clone());
        info!(revision = document.revision, "document saved");
        Ok(())
    }

    /// Run a read-modify-write cycle with exclusive access to the store.
    ///
    /// The document is re-read from disk, handed to `mutate`, and written
    /// back with its revision bumped only if `mutate` succeeds. A failed
    /// write fails the whole operation.
    pub fn update<R, E, F>(&self, mutate: F) -> Result<R, E>
    where
        F: FnOnce(&mut Document) -> Result<R, E>,
        E: From<StoreError>,
    {
        let _guard = self.writer.lock();
        let mut document = self.read(true);
        let outcome = mutate(&mut document)?;
        document.revision += 1;
        self.try_write(&document)?;
        Ok(outcome)
    }

    /// Persist `document` only if nobody has written since it was read.
    /// Returns the new revision.
    pub fn compare_and_write(&self, document: &Document) -> Result<u64, StoreError> {
        let _guard = self.writer.lock();
        let found = self.read(true).revision;
        if found != document.revision {
            return Err(StoreError::Conflict {
                expected: document.revision,
                found,
            });
        }

        let mut next = document.clone();
        next.revision += 1;
        self.try_write(&next)?;
        Ok(next.revision)
    }

    /// Revision of the document as currently visible to readers.
    pub fn revision(&self) -> u64 {
        if let Some(cached) = self.cache.read().as_ref() {
            return cached.document.revision;
        }
        self.read(false).revision
    }

    /// Age of the cached copy, or `None` while the store is cold.
    pub fn cache_age(&self) -> Option<Duration> {
        self.cache
            .read()
            .as_ref()
            .map(|cached| cached.loaded_at.elapsed())
    }

    /// Drop the cached copy so the next read goes to disk.
    pub fn invalidate(&self) {
        self.cache.write().take();
    }

    fn load(&self) -> Document {
        match self.file.load() {
            Ok(mut document) => {
                if document.migrate() {
                    info!(
                        version = document.schema_version,
                        "document migrated to current schema"
                    );
                    if let Err(err) = self.file.save(&document) {
                        error!("failed to save migrated document: {err}");
                    }
                }
                info!(revision = document.revision, "document loaded");
                document
            }
            Err(err) => self.file.recover(&err, || self.defaults.clone()),
        }
    }

    fn remember(&self, document: Document) {
        *self.cache.write() = Some(Cached {
            document,
            loaded_at: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs;
    use tempfile::tempdir;

    use crate::document::UserRecord;

    fn with_balance(document: &mut Document, id: &str, balance: i64) {
        document.users.insert(
            id.to_string(),
            UserRecord {
                balance,
                ..UserRecord::default()
            },
        );
    }

    #[test]
    fn cold_store_creates_skeleton() -> Result<()> {
        let dir = tempdir()?;
        let store = SnapshotStore::open(dir.path().join("data.json"), DEFAULT_FRESHNESS);
        assert!(store.cache_age().is_none());

        let document = store.read(false);
        assert_eq!(document, Document::default());
        assert!(store.path().exists());
        assert!(store.cache_age().is_some());
        Ok(())
    }

    #[test]
    fn custom_defaults_seed_admins() -> Result<()> {
        let dir = tempdir()?;
        let store = SnapshotStore::open(dir.path().join("data.json"), DEFAULT_FRESHNESS)
            .with_defaults(Document::with_admins([7, 7, 9]));
        assert_eq!(store.read(false).admins, vec![7, 9]);
        Ok(())
    }

    #[test]
    fn zero_window_always_reloads() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data.json");
        let store = SnapshotStore::open(&path, Duration::ZERO);
        let mut document = store.read(false);
        with_balance(&mut document, "1", 10);
        assert!(store.write(&document));

        let mut outside = document.clone();
        with_balance(&mut outside, "1", 20);
        SnapshotFile::<Document>::new(&path).save(&outside)?;

        assert_eq!(store.read(false).users["1"].balance, 20);
        Ok(())
    }

    #[test]
    fn update_bumps_revision_and_skips_failed_mutations() -> Result<()> {
        let dir = tempdir()?;
        let store = SnapshotStore::open(dir.path().join("data.json"), DEFAULT_FRESHNESS);

        store.update(|document| {
            with_balance(document, "5", 100);
            Ok::<_, StoreError>(())
        })?;
        assert_eq!(store.revision(), 1);

        let failed: Result<(), StoreError> = store.update(|document| {
            with_balance(document, "5", 0);
            Err(StoreError::Conflict {
                expected: 0,
                found: 0,
            })
        });
        assert!(failed.is_err());
        assert_eq!(store.read(true).users["5"].balance, 100);
        assert_eq!(store.revision(), 1);
        Ok(())
    }

    #[test]
    fn compare_and_write_rejects_stale_documents() -> Result<()> {
        let dir = tempdir()?;
        let store = SnapshotStore::open(dir.path().join("data.json"), DEFAULT_FRESHNESS);
        let first = store.read(false);
        let second = store.read(false);

        assert_eq!(store.compare_and_write(&first)?, 1);
        let err = store.compare_and_write(&second).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 0,
                found: 1
            }
        ));
        Ok(())
    }

    #[test]
    fn failed_write_reports_false_and_keeps_cache() -> Result<()> {
        let dir = tempdir()?;
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"")?;
        let store = SnapshotStore::open(blocker.join("data.json"), DEFAULT_FRESHNESS);

        let mut document = store.read(false);
        with_balance(&mut document, "1", 1);
        assert!(!store.write(&document));
        assert!(store.read(false).users.is_empty());
        Ok(())
    }

    #[test]
    fn invalidate_forces_reload() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data.json");
        let store = SnapshotStore::open(&path, DEFAULT_FRESHNESS);
        store.read(false);
        store.invalidate();
        assert!(store.cache_age().is_none());

        let mut outside = Document::default();
        with_balance(&mut outside, "3", 3);
        SnapshotFile::<Document>::new(&path).save(&outside)?;
        assert_eq!(store.read(false).users["3"].balance, 3);
        Ok(())
    }
}
