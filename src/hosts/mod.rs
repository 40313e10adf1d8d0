//! Host override sources and the merged host table.
//!
//! # Sources
//!
//! - **Data directory**: operator-maintained host files shipped with the proxy
//! - **Cloud cache**: remote host lists downloaded by [`CloudSync`] into
//!   `hosts_<i>.txt` slots
//! - **Local overrides**: `user_hosts.conf`, checked before everything else
//!
//! # Example
//!
//! ```
//! use autohost::hosts::{HostTable, HostMapping};
//!
//! let table = HostTable::default();
//! let mapping: HostMapping = [("example.com".to_string(), "1.2.3.4".to_string())]
//!     .into_iter()
//!     .collect();
//! table.swap(mapping);
//! assert_eq!(table.lookup("example.com").as_deref(), Some("1.2.3.4"));
//! ```

mod parser;
mod pattern;
pub mod sync;
mod table;

use std::collections::BTreeMap;

pub use parser::{load_file, merge_directory, parse_directory, parse_entries, write_mapping};
pub use pattern::{PatternError, PatternSet};
pub use sync::{CloudSync, SyncError, SyncReport};
pub use table::HostTable;

/// User-maintained override file, loaded with priority over the merged table.
pub const USER_HOSTS_FILE: &str = "user_hosts.conf";

/// Reserved for manually curated cloud content; never loaded by the merge pass.
pub const CLOUD_HOSTS_FILE: &str = "cloud_hosts.conf";

/// Returns the cache file name for the repo at `index`.
#[must_use]
pub fn cache_file_name(index: usize) -> String {
    format!("hosts_{index}.txt")
}

/// Inverse of [`cache_file_name`].
fn cache_index(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix("hosts_")?
        .strip_suffix(".txt")?
        .parse()
        .ok()
}

/// Hostname to override address mapping.
///
/// Keys are unique and iterated in name order; inserting an existing name
/// replaces its address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMapping {
    entries: BTreeMap<String, String>,
}

impl HostMapping {
    pub fn insert(&mut self, name: String, address: String) -> Option<String> {
        self.entries.insert(name, address)
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    /// Merge `other` into `self`, entries of `other` winning.
    pub fn extend(&mut self, other: HostMapping) {
        self.entries.extend(other.entries);
    }
}

impl FromIterator<(String, String)> for HostMapping {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
