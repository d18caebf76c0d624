//! Synchronized owner of the live whitelist.
//!
//! All reads and writes go through one `RwLock`. Evaluation in limit mode
//! takes a read lock for the whole decision so it sees one consistent
//! whitelist. Recording in learn mode first checks under the read lock and
//! only upgrades to the write lock when something is actually new, then
//! re-checks, so concurrent recorders never lose or duplicate an entry.
//!
//! Every successful mutation bumps a generation counter and wakes the
//! persister. `save` serializes a snapshot outside the lock and advances the
//! saved generation, so a failed save leaves the mutations counted as unsaved
//! and the next trigger retries.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{Whitelist, WhitelistError, file};
use crate::pattern::EndpointMatch;

/// Shared, synchronized whitelist with durable backing file.
pub struct WhitelistStore {
    path: PathBuf,
    inner: RwLock<Whitelist>,
    /// Mutations applied so far.
    generation: AtomicU64,
    /// Highest generation written to disk.
    saved_generation: AtomicU64,
    changed: Notify,
    /// Serializes saves so an older snapshot never overwrites a newer one.
    save_lock: Mutex<()>,
}

impl std::fmt::Debug for WhitelistStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhitelistStore")
            .field("path", &self.path)
            .field("generation", &self.generation.load(Ordering::Acquire))
            .field("saved_generation", &self.saved_generation.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl WhitelistStore {
    /// Wrap an in-memory whitelist backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, whitelist: Whitelist) -> Self {
        Self {
            path: path.into(),
            inner: RwLock::new(whitelist),
            generation: AtomicU64::new(0),
            saved_generation: AtomicU64::new(0),
            changed: Notify::new(),
            save_lock: Mutex::new(()),
        }
    }

    /// Load from `path`. A missing file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, WhitelistError> {
        let path = path.into();
        let whitelist = file::load(&path)?;
        debug!(
            path = %path.display(),
            endpoints = whitelist.endpoint_count(),
            entities = whitelist.entity_count(),
            "Whitelist loaded"
        );
        Ok(Self::new(path, whitelist))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against a consistent view of the whitelist.
    pub fn read<R>(&self, f: impl FnOnce(&Whitelist) -> R) -> R {
        f(&*self.inner.read())
    }

    /// Clone the current whitelist.
    #[must_use]
    pub fn snapshot(&self) -> Whitelist {
        self.inner.read().clone()
    }

    #[must_use]
    pub fn match_endpoint(&self, path: &str) -> Option<EndpointMatch> {
        self.inner.read().match_endpoint(path)
    }

    #[must_use]
    pub fn contains_endpoint(&self, path: &str) -> bool {
        self.inner.read().contains_endpoint(path)
    }

    pub fn contains_entities<'a, I>(&self, ids: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        self.inner.read().contains_entities(ids)
    }

    /// Current (endpoint, entity) counts.
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        let guard = self.inner.read();
        (guard.endpoint_count(), guard.entity_count())
    }

    /// Add `path` as a literal template unless an existing template matches.
    ///
    /// Returns the template string if one was added.
    pub fn record_endpoint(&self, path: &str) -> Option<String> {
        if self.inner.read().contains_endpoint(path) {
            return None;
        }
        let added = self.inner.write().record_endpoint(path)?;
        self.mark_changed(1);
        Some(added)
    }

    /// Add each identifier not already covered by a pattern as an exact entry.
    ///
    /// Returns the identifiers that were added.
    pub fn record_entities<'a, I>(&self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let missing: Vec<&String> = {
            let guard = self.inner.read();
            ids.into_iter().filter(|id| !guard.contains_entity(id)).collect()
        };
        if missing.is_empty() {
            return Vec::new();
        }

        let added: Vec<String> = {
            let mut guard = self.inner.write();
            missing
                .into_iter()
                .filter(|id| guard.record_entity(id))
                .cloned()
                .collect()
        };
        if !added.is_empty() {
            self.mark_changed(added.len() as u64);
        }
        added
    }

    fn mark_changed(&self, mutations: u64) {
        self.generation.fetch_add(mutations, Ordering::AcqRel);
        self.changed.notify_one();
    }

    /// Mutations not yet written to disk.
    #[must_use]
    pub fn unsaved_mutations(&self) -> u64 {
        let generation = self.generation.load(Ordering::Acquire);
        generation.saturating_sub(self.saved_generation.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.unsaved_mutations() > 0
    }

    /// Wait until the next mutation.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    /// Write the current whitelist to disk atomically.
    ///
    /// Blocking: call from `spawn_blocking` on the async path. On failure the
    /// in-memory whitelist is untouched and remains dirty.
    pub fn save(&self) -> Result<(), WhitelistError> {
        let _serialized = self.save_lock.lock();

        let (generation, snapshot) = {
            let guard = self.inner.read();
            (self.generation.load(Ordering::Acquire), guard.clone())
        };

        file::save(&self.path, &snapshot)?;
        self.saved_generation.fetch_max(generation, Ordering::AcqRel);

        info!(
            path = %self.path.display(),
            endpoints = snapshot.endpoint_count(),
            entities = snapshot.entity_count(),
            "Whitelist saved"
        );
        Ok(())
    }
}
