//! Dependency records and the store that owns them.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::{Result, SandboxError};
use crate::loader::LoaderResult;
use crate::source_map::SourceMap;
use crate::strategy::canonical_uri;

/// SHA-256 of a dependency's raw content, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    /// Content is known but has not been transformed yet.
    Pending,
    /// A loader is transforming the content.
    Loading,
    /// Transformed output and imports are current for the fingerprint.
    Loaded,
    /// The last transform attempt failed.
    Failed,
}

/// The identity a loader sees for the dependency it transforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRef {
    pub uri: String,
    pub fingerprint: Fingerprint,
}

/// One addressable source asset.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub uri: String,
    pub mime_type: String,
    pub content: String,
    pub fingerprint: Fingerprint,
    pub transformed_content: Option<String>,
    pub source_map: Option<SourceMap>,
    pub imported_uris: Vec<String>,
    pub state: DependencyState,
}

impl Dependency {
    fn new(uri: String, mime_type: String, content: String) -> Self {
        let fingerprint = Fingerprint::of(&content);
        Self {
            uri,
            mime_type,
            content,
            fingerprint,
            transformed_content: None,
            source_map: None,
            imported_uris: Vec::new(),
            state: DependencyState::Pending,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state == DependencyState::Loaded
    }

    pub fn reference(&self) -> DependencyRef {
        DependencyRef {
            uri: self.uri.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }

    pub(crate) fn apply(&mut self, result: LoaderResult) {
        self.transformed_content = Some(result.content);
        self.source_map = result.map;
        self.imported_uris = result.imported_dependency_uris;
        self.state = DependencyState::Loaded;
    }
}

/// What an upsert did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// First time this uri was seen.
    Created,
    /// Content or type changed; the entry is pending again.
    Changed,
    /// Same fingerprint and type; nothing to do.
    Unchanged,
}

/// Dependencies keyed by canonical uri, one entry per uri.
#[derive(Debug, Clone, Default)]
pub struct DependencyStore {
    entries: BTreeMap<String, Dependency>,
}

impl DependencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uri: &str) -> Option<&Dependency> {
        self.entries.get(uri)
    }

    pub(crate) fn get_mut(&mut self, uri: &str) -> Option<&mut Dependency> {
        self.entries.get_mut(uri)
    }

    /// Create or refresh the entry for `uri`.
    ///
    /// A matching fingerprint and type leaves the entry untouched, including
    /// its transformed output. Anything else resets it to `Pending` and drops
    /// the stale output.
    pub fn upsert(&mut self, uri: &str, mime_type: &str, content: String) -> Result<Upsert> {
        let uri = canonical_uri(uri)
            .map_err(|e| SandboxError::resolution(uri, None, e))?;

        if let Some(existing) = self.entries.get_mut(&uri) {
            let fingerprint = Fingerprint::of(&content);
            if existing.fingerprint == fingerprint && existing.mime_type == mime_type {
                return Ok(Upsert::Unchanged);
            }
            *existing = Dependency::new(uri, mime_type.to_string(), content);
            return Ok(Upsert::Changed);
        }

        let dependency = Dependency::new(uri.clone(), mime_type.to_string(), content);
        self.entries.insert(uri, dependency);
        Ok(Upsert::Created)
    }

    pub fn remove(&mut self, uri: &str) -> Option<Dependency> {
        self.entries.remove(uri)
    }

    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) -> Vec<String> {
        let removed: Vec<String> = self
            .entries
            .keys()
            .filter(|uri| !keep(uri))
            .cloned()
            .collect();
        for uri in &removed {
            self.entries.remove(uri);
        }
        removed
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.entries.contains_key(uri)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_content_hash() {
        assert_eq!(Fingerprint::of("a"), Fingerprint::of("a"));
        assert_ne!(Fingerprint::of("a"), Fingerprint::of("b"));
        assert_eq!(
            Fingerprint::of("").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_upsert_is_fingerprint_gated() {
        let mut store = DependencyStore::new();
        let uri = "mem:///index.html";

        assert_eq!(store.upsert(uri, "text/html", "<p>".into()).unwrap(), Upsert::Created);
        store.get_mut(uri).unwrap().apply(LoaderResult::passthrough("<p>".into()));
        assert!(store.get(uri).unwrap().is_loaded());

        assert_eq!(store.upsert(uri, "text/html", "<p>".into()).unwrap(), Upsert::Unchanged);
        assert!(store.get(uri).unwrap().is_loaded());

        assert_eq!(store.upsert(uri, "text/html", "<b>".into()).unwrap(), Upsert::Changed);
        let dependency = store.get(uri).unwrap();
        assert_eq!(dependency.state, DependencyState::Pending);
        assert!(dependency.transformed_content.is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_type_change_resets_entry() {
        let mut store = DependencyStore::new();
        store.upsert("mem:///a", "text/plain", "x".into()).unwrap();
        assert_eq!(store.upsert("mem:///a", "text/css", "x".into()).unwrap(), Upsert::Changed);
    }

    #[test]
    fn test_invalid_uri_is_resolution_error() {
        let mut store = DependencyStore::new();
        let err = store.upsert("relative/path.html", "text/html", String::new()).unwrap_err();
        assert!(err.is_resolution());
        assert!(store.is_empty());
    }

    #[test]
    fn test_retain_and_remove() {
        let mut store = DependencyStore::new();
        for uri in ["mem:///a", "mem:///b", "mem:///c"] {
            store.upsert(uri, "text/plain", uri.into()).unwrap();
        }
        let removed = store.retain(|uri| uri != "mem:///b");
        assert_eq!(removed, vec!["mem:///b".to_string()]);
        assert!(store.remove("mem:///a").is_some());
        assert!(store.remove("mem:///a").is_none());
        assert_eq!(store.iter().map(|d| d.uri.as_str()).collect::<Vec<_>>(), vec!["mem:///c"]);
    }
}
