//! The merged host table.
//!
//! Readers take a cheap `Arc` clone of the current snapshot under a short read
//! lock; the single writer builds a complete mapping off to the side and
//! replaces the `Arc` under a short write lock. A reader therefore sees either
//! the whole previous table or the whole new one.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use super::parser::{load_file, merge_directory};
use super::{HostMapping, PatternSet, USER_HOSTS_FILE};

/// Concurrently readable host table with atomic replacement.
#[derive(Debug, Default)]
pub struct HostTable {
    /// Merged data directory and cloud cache entries.
    merged: RwLock<Arc<HostMapping>>,
    /// `user_hosts.conf` entries, consulted before `merged`.
    local: RwLock<Arc<HostMapping>>,
}

impl HostTable {
    pub fn new(merged: HostMapping, local: HostMapping) -> Self {
        Self {
            merged: RwLock::new(Arc::new(merged)),
            local: RwLock::new(Arc::new(local)),
        }
    }

    /// Build a table from disk: the merged directories plus the local
    /// overrides found in `data_dir`.
    pub fn load(data_dir: &Path, cache_dir: &Path, except: &PatternSet) -> Self {
        let local = load_file(&data_dir.join(USER_HOSTS_FILE)).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to load local host overrides");
            HostMapping::default()
        });
        Self::new(Self::rebuild(data_dir, cache_dir, except), local)
    }

    /// Merge the data directory, then the cloud cache directory, into a new
    /// mapping. Cache entries override data directory entries.
    pub fn rebuild(data_dir: &Path, cache_dir: &Path, except: &PatternSet) -> HostMapping {
        let mut mapping = HostMapping::default();
        merge_directory(&mut mapping, data_dir, except);
        merge_directory(&mut mapping, cache_dir, except);

        tracing::info!(entries = mapping.len(), "rebuilt host table");
        mapping
    }

    /// Look up the override address for `host`.
    pub fn lookup(&self, host: &str) -> Option<String> {
        if let Some(address) = self.local.read().get(host) {
            return Some(address.to_string());
        }
        self.snapshot().get(host).map(str::to_string)
    }

    /// Current merged snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<HostMapping> {
        self.merged.read().clone()
    }

    /// Atomically replace the merged snapshot.
    pub fn swap(&self, mapping: HostMapping) {
        let mapping = Arc::new(mapping);
        let previous = std::mem::replace(&mut *self.merged.write(), mapping);
        // drop the old table outside the lock
        drop(previous);
    }

    pub fn set_local_overrides(&self, mapping: HostMapping) {
        *self.local.write() = Arc::new(mapping);
    }

    #[must_use]
    pub fn local_overrides(&self) -> Arc<HostMapping> {
        self.local.read().clone()
    }

    /// Number of entries in the merged snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.merged.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.merged.read().is_empty()
    }
}
