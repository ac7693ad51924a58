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

//! The ETag manifest passed from the server to the service worker

use serde::{Deserialize, Serialize};
use std::collections::btree_map::{BTreeMap, Iter};
use std::fmt::Display;

/// Name of the response header carrying the manifest
pub const MANIFEST_HEADER: &str = "X-Etag-Config";

/// The error type returned when a manifest cannot be decoded
#[derive(Debug)]
pub struct ManifestDecodeError(serde_json::Error);

impl Display for ManifestDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "Invalid ETag manifest: {}", self.0)
    }
}

impl std::error::Error for ManifestDecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// Maps resource references, exactly as they appear in the markup, to their ETags.
///
/// Serialized as a flat JSON object with keys in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EtagManifest(BTreeMap<String, String>);

impl EtagManifest {
    /// Creates an empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a manifest from its JSON representation. Anything but a flat object with string
    /// values is rejected.
    pub fn from_json(json: &str) -> Result<Self, ManifestDecodeError> {
        serde_json::from_str(json).map_err(ManifestDecodeError)
    }

    /// Serializes the manifest into JSON.
    pub fn to_json(&self) -> String {
        // A map of strings always serializes
        serde_json::to_string(&self.0).unwrap_or_else(|_| String::from("{}"))
    }

    /// Retrieves the ETag for a reference.
    pub fn get(&self, reference: &str) -> Option<&str> {
        self.0.get(reference).map(String::as_str)
    }

    /// Adds or replaces an entry.
    pub fn insert(&mut self, reference: impl Into<String>, etag: impl Into<String>) {
        self.0.insert(reference.into(), etag.into());
    }

    /// Copies all entries of `other` into this manifest, entries of `other` win.
    pub fn extend(&mut self, other: EtagManifest) {
        self.0.extend(other.0);
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks whether the manifest has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over reference/ETag pairs in sorted order.
    pub fn iter(&self) -> Iter<'_, String, String> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EtagManifest {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json() {
        let manifest = EtagManifest::from_iter([("/b.js", "\"2\""), ("/a.png", "\"1\"")]);
        assert_eq!(manifest.to_json(), r#"{"/a.png":"\"1\"","/b.js":"\"2\""}"#);
        assert_eq!(EtagManifest::from_json(&manifest.to_json()).unwrap(), manifest);
        assert_eq!(EtagManifest::new().to_json(), "{}");
    }

    #[test]
    fn rejects_non_flat_objects() {
        assert!(EtagManifest::from_json(r#"{"a": 1}"#).is_err());
        assert!(EtagManifest::from_json(r#"{"a": {"b": "c"}}"#).is_err());
        assert!(EtagManifest::from_json(r#"["a"]"#).is_err());
        assert!(EtagManifest::from_json("nonsense").is_err());
    }

    #[test]
    fn extend_overwrites() {
        let mut manifest = EtagManifest::from_iter([("a", "1"), ("b", "2")]);
        manifest.extend(EtagManifest::from_iter([("b", "3"), ("c", "4")]));
        assert_eq!(manifest.get("a"), Some("1"));
        assert_eq!(manifest.get("b"), Some("3"));
        assert_eq!(manifest.get("c"), Some("4"));
        assert_eq!(manifest.len(), 3);
    }
}
