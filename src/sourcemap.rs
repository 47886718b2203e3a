//! Bi-directional mapping between remote source names and local files.
//!
//! The target's protocol speaks of URLs, but they are really opaque names
//! (closer to URIs or URNs), so matching works on full names, local paths and
//! base filenames rather than on parsed URL structure.

use crate::encoding::{decode_bytes, EncodingResolver};
use crate::error::Error;
use indexmap::IndexMap;
use log::{debug, warn};
use std::fs;

/// Last path component, accepting both separator styles since remote names
/// may come from a Windows target.
fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or("")
}

/// A local source file. Does not necessarily exist on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSource {
    /// Base filename of this source.
    pub name: String,
    /// Absolute local path; empty means no local file yet.
    pub path: String,
    /// Alternative base names accepted as a match.
    pub alias_names: Vec<String>,
    /// Artificial key the front-end uses to retrieve the source when no local
    /// path resolves; 0 means "not retrievable by reference".
    pub source_reference: i64,
}

impl LocalSource {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: base_name(&path).to_string(),
            path,
            alias_names: Vec::new(),
            source_reference: 0,
        }
    }

    /// Read the file at `path` and decode it with the resolved encoding.
    ///
    /// An encoding name the decoder does not know is a hard failure even when
    /// detection itself succeeded; it is never coerced to a default.
    pub fn load_from_disk(&self, resolver: &EncodingResolver) -> Result<String, Error> {
        let bytes = fs::read(&self.path)?;
        let encoding = resolver.detect(&bytes)?;
        debug!(
            target: "sourcemap",
            "source file \"{}\" seems to be {encoding}-encoded", self.name
        );
        decode_bytes(&bytes, &encoding)
    }
}

/// Registry of remote source identities, keyed by remote name. One instance
/// per connection session; iteration order is insertion order, which makes
/// lookup tie-breaks stable.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    map: IndexMap<String, LocalSource>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.map.len()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Replace the whole mapping with the target's authoritative source list.
    /// Every prior association is dropped. Names with an empty base filename
    /// get no alias and stay matchable only by exact path equality.
    pub fn set_all_remote_urls(&mut self, remote_names: &[String]) {
        debug!(target: "sourcemap", "set all remote urls: {remote_names:?}");

        self.map.clear();
        for remote_name in remote_names {
            let base = base_name(remote_name);
            let mut local_source = LocalSource::new("");
            if !base.is_empty() {
                local_source.alias_names.push(base.to_string());
            }
            self.map.insert(remote_name.clone(), local_source);
        }
    }

    /// Insert or overwrite the entry for `remote_name`.
    pub fn add_mapping(&mut self, local_source: LocalSource, remote_name: impl Into<String>) {
        self.map.insert(remote_name.into(), local_source);
    }

    /// Resolve a local path to the remote name the target knows it by.
    ///
    /// Path equality wins over an alias match; with no match at all the path
    /// itself is returned unchanged (availability over strictness).
    pub fn get_remote_url(&self, local_path: &str) -> String {
        let base = base_name(local_path);

        let mut remote_name = self
            .map
            .iter()
            .find(|(_, source)| source.path == local_path)
            .map(|(name, _)| name.as_str());

        if remote_name.is_none() {
            remote_name = self
                .map
                .iter()
                .find(|(_, source)| source.alias_names.iter().any(|alias| alias == base))
                .map(|(name, _)| name.as_str());
        }

        let remote_name = remote_name.unwrap_or_else(|| {
            warn!(target: "sourcemap", "no remote name found for \"{local_path}\"");
            local_path
        });
        debug!(target: "sourcemap", "get remote url: \"{local_path}\" -> \"{remote_name}\"");
        remote_name.to_string()
    }

    pub fn get_source(&self, remote_name: &str) -> Option<&LocalSource> {
        self.map.get(remote_name)
    }

    pub fn get_source_mut(&mut self, remote_name: &str) -> Option<&mut LocalSource> {
        self.map.get_mut(remote_name)
    }

    /// Find a source by its reference handle. 0 is the explicit "no reference"
    /// sentinel, so non-positive values never match anything.
    pub fn get_source_by_reference(&self, source_reference: i64) -> Option<&LocalSource> {
        if source_reference <= 0 {
            return None;
        }
        self.map
            .values()
            .find(|source| source.source_reference == source_reference)
    }
}
