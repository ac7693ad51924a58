// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Server-side registry of known ETags
//!
//! The registry is shared by all request handlers and the revalidation sweep. It is a best-effort
//! cache: nothing is persisted, and once the capacity is reached the least recently written entry
//! is dropped.

use log::trace;
use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;

use crate::manifest::{EtagManifest, ManifestDecodeError};

/// Number of entries kept by default
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Thread-safe mapping from resource keys (absolute URLs or site-relative paths) to ETags
#[derive(Debug)]
pub struct EtagRegistry {
    entries: RwLock<LruCache<String, String>>,
}

impl Default for EtagRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EtagRegistry {
    /// Creates an empty registry holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Records the ETag for a key, replacing any previous value. Empty keys and empty ETags are
    /// ignored.
    pub fn set(&self, key: &str, etag: &str) {
        if key.is_empty() || etag.is_empty() {
            return;
        }

        trace!("registering ETag {etag} for {key}");
        self.entries.write().put(key.to_owned(), etag.to_owned());
    }

    /// Replaces the ETag of an existing entry. Returns `false` without adding anything if the key
    /// isn’t present (any longer) or the ETag is empty.
    pub fn refresh(&self, key: &str, etag: &str) -> bool {
        if etag.is_empty() {
            return false;
        }

        match self.entries.write().peek_mut(key) {
            Some(value) => {
                etag.clone_into(value);
                true
            }
            None => false,
        }
    }

    /// Retrieves the ETag registered for a key.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().peek(key).cloned()
    }

    /// Number of registered keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Checks whether the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns a snapshot of all registered keys.
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().iter().map(|(key, _)| key.clone()).collect()
    }

    /// Copies all registered entries into the manifest. Registry values replace existing
    /// manifest entries for the same key.
    pub fn overlay(&self, manifest: &mut EtagManifest) {
        for (key, etag) in self.entries.read().iter() {
            manifest.insert(key.as_str(), etag.as_str());
        }
    }

    /// Parses a JSON manifest, overlays all registered entries (see [`EtagRegistry::overlay`])
    /// and returns the combined manifest as JSON.
    pub fn merge(&self, manifest_json: &str) -> Result<String, ManifestDecodeError> {
        let mut manifest = EtagManifest::from_json(manifest_json)?;
        self.overlay(&mut manifest);
        Ok(manifest.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_and_get() {
        let registry = EtagRegistry::default();
        assert!(registry.is_empty());

        registry.set("https://example.com/a.js", "\"abc\"");
        assert_eq!(
            registry.get("https://example.com/a.js").as_deref(),
            Some("\"abc\"")
        );

        registry.set("https://example.com/a.js", "\"def\"");
        assert_eq!(
            registry.get("https://example.com/a.js").as_deref(),
            Some("\"def\"")
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_values_ignored() {
        let registry = EtagRegistry::default();
        registry.set("https://example.com/a.js", "\"abc\"");

        registry.set("", "\"xyz\"");
        registry.set("https://example.com/b.js", "");
        registry.set("https://example.com/a.js", "");
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("https://example.com/a.js").as_deref(),
            Some("\"abc\"")
        );
    }

    #[test]
    fn merge_precedence() {
        let registry = EtagRegistry::default();
        registry.set("/logo.png", "\"registry\"");
        registry.set("https://cdn.example.com/x.js", "\"remote\"");

        let merged = registry
            .merge(r#"{"/logo.png":"\"scanned\"","/style.css":"\"css\""}"#)
            .unwrap();
        let merged = EtagManifest::from_json(&merged).unwrap();
        assert_eq!(merged.get("/logo.png"), Some("\"registry\""));
        assert_eq!(merged.get("/style.css"), Some("\"css\""));
        assert_eq!(merged.get("https://cdn.example.com/x.js"), Some("\"remote\""));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn merge_rejects_invalid_json() {
        let registry = EtagRegistry::default();
        registry.set("/logo.png", "\"registry\"");
        assert!(registry.merge("[1, 2]").is_err());
        assert!(registry.merge(r#"{"a": true}"#).is_err());
        assert!(registry.merge("").is_err());
        assert_eq!(registry.merge("{}").unwrap(), r#"{"/logo.png":"\"registry\""}"#);
    }

    #[test]
    fn capacity_evicts_least_recently_written() {
        let registry = EtagRegistry::new(2);
        registry.set("a", "1");
        registry.set("b", "2");
        registry.set("a", "3");
        registry.set("c", "4");

        assert_eq!(registry.len(), 2);
        assert!(registry.get("b").is_none());
        assert_eq!(registry.get("a").as_deref(), Some("3"));
        assert_eq!(registry.get("c").as_deref(), Some("4"));

        let registry = EtagRegistry::new(0);
        registry.set("a", "1");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn refresh_only_existing() {
        let registry = EtagRegistry::default();
        registry.set("a", "1");
        assert!(registry.refresh("a", "2"));
        assert!(!registry.refresh("a", ""));
        assert!(!registry.refresh("b", "3"));
        assert_eq!(registry.get("a").as_deref(), Some("2"));
        assert!(registry.get("b").is_none());

        let mut keys = registry.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_owned()]);
    }

    #[test]
    fn concurrent_access() {
        let registry = Arc::new(EtagRegistry::default());
        let handles: Vec<_> = (0..8)
            .map(|thread_index| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        registry.set(&format!("key{i}"), &format!("\"{thread_index}\""));
                        let _ = registry.merge("{}").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 100);
    }
}
