//! Lazy-start link index: served directory to the spec that fills it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use streamd_core::stream::RawStreamSpec;

/// One of the two on-demand indexes (VOD or COD), shared between the daemon
/// and the HTTP servers.
#[derive(Debug, Default)]
pub struct LinkIndex {
    entries: Mutex<HashMap<PathBuf, RawStreamSpec>>,
}

impl LinkIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, RawStreamSpec>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the spec registered for `dir`.
    #[must_use]
    pub fn find(&self, dir: &Path) -> Option<RawStreamSpec> {
        self.entries().get(dir).cloned()
    }

    pub fn insert(&self, dir: PathBuf, spec: RawStreamSpec) {
        self.entries().insert(dir, spec);
    }

    /// Add or refresh a batch of links under one lock. Links not in the
    /// batch are kept.
    pub fn extend(&self, links: impl IntoIterator<Item = (PathBuf, RawStreamSpec)>) {
        self.entries().extend(links);
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<PathBuf, RawStreamSpec> {
        self.entries().clone()
    }

    /// Stream ids of every linked spec.
    #[must_use]
    pub fn stream_ids(&self) -> Vec<String> {
        self.entries()
            .values()
            .filter_map(|spec| spec.id().map(str::to_string))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(id: &str) -> RawStreamSpec {
        RawStreamSpec::from_value(json!({"id": id, "type": 10})).unwrap()
    }

    #[test]
    fn test_find_returns_copy() {
        let index = LinkIndex::new();
        index.insert(PathBuf::from("/cods/a"), spec("a"));
        let found = index.find(Path::new("/cods/a")).unwrap();
        assert_eq!(found.id(), Some("a"));
        assert!(index.find(Path::new("/cods/b")).is_none());
    }

    #[test]
    fn test_insert_replaces_entry() {
        let index = LinkIndex::new();
        index.insert(PathBuf::from("/cods/a"), spec("a"));
        index.insert(PathBuf::from("/cods/a"), spec("a2"));
        assert_eq!(index.len(), 1);
        assert_eq!(index.find(Path::new("/cods/a")).unwrap().id(), Some("a2"));
    }

    #[test]
    fn test_extend_keeps_existing_links() {
        let index = LinkIndex::new();
        index.insert(PathBuf::from("/cods/old"), spec("old"));
        index.insert(PathBuf::from("/cods/shared"), spec("before"));

        index.extend([
            (PathBuf::from("/cods/new"), spec("new")),
            (PathBuf::from("/cods/shared"), spec("after")),
        ]);

        assert_eq!(index.len(), 3);
        assert_eq!(
            index.find(Path::new("/cods/old")).unwrap().id(),
            Some("old"),
        );
        assert_eq!(
            index.find(Path::new("/cods/shared")).unwrap().id(),
            Some("after")
        );
    }

    #[test]
    fn test_clear_and_snapshot() {
        let index = LinkIndex::new();
        index.insert(PathBuf::from("/vods/a"), spec("a"));
        let snapshot = index.snapshot();
        index.clear();
        assert!(index.is_empty());
        assert_eq!(snapshot.len(), 1);
    }
}
