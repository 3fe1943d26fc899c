//! Gallery of enrolled identities.
//!
//! Matching only ever reads an immutable [`GallerySnapshot`]; writers swap in
//! a new vector so snapshots already handed out stay valid.

use crate::types::GalleryEntry;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Read-only view of the gallery at a point in time.
pub type GallerySnapshot = Arc<Vec<GalleryEntry>>;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery entry already exists: {0}")]
    DuplicateId(String),
    #[error("gallery lock poisoned")]
    Poisoned,
    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Storage of enrolled identity records.
///
/// Implementations are chosen at construction time; matching code never
/// branches on the backend.
pub trait Gallery: Send + Sync {
    /// Consistent copy of all entries, in insertion order.
    fn snapshot(&self) -> Result<GallerySnapshot, GalleryError>;

    fn add(&self, entry: GalleryEntry) -> Result<(), GalleryError>;

    /// Remove an entry by id. Returns whether anything was removed.
    fn remove(&self, id: &str) -> Result<bool, GalleryError>;

    fn len(&self) -> Result<usize, GalleryError> {
        Ok(self.snapshot()?.len())
    }

    fn is_empty(&self) -> Result<bool, GalleryError> {
        Ok(self.len()? == 0)
    }

    /// Distinct enrolled identity labels, sorted.
    fn identities(&self) -> Result<Vec<String>, GalleryError> {
        let snapshot = self.snapshot()?;
        let names: BTreeSet<&str> = snapshot.iter().map(|e| e.identity.as_str()).collect();
        Ok(names.into_iter().map(str::to_string).collect())
    }
}

/// Process-local gallery with copy-on-write snapshots.
#[derive(Debug, Default)]
pub struct InMemoryGallery {
    entries: RwLock<GallerySnapshot>,
}

impl InMemoryGallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<GalleryEntry>) -> Self {
        Self {
            entries: RwLock::new(Arc::new(entries)),
        }
    }

    fn update<T>(&self, f: impl FnOnce(&mut Vec<GalleryEntry>) -> T) -> Result<T, GalleryError> {
        let mut guard = self.entries.write().map_err(|_| GalleryError::Poisoned)?;
        // Clones only when a snapshot is still held elsewhere.
        Ok(f(Arc::make_mut(&mut *guard)))
    }
}

impl Gallery for InMemoryGallery {
    fn snapshot(&self) -> Result<GallerySnapshot, GalleryError> {
        let guard = self.entries.read().map_err(|_| GalleryError::Poisoned)?;
        Ok(Arc::clone(&guard))
    }

    fn add(&self, entry: GalleryEntry) -> Result<(), GalleryError> {
        self.update(|entries| {
            if entries.iter().any(|e| e.id == entry.id) {
                return Err(GalleryError::DuplicateId(entry.id));
            }
            tracing::debug!(id = %entry.id, identity = %entry.identity, "gallery entry added");
            entries.push(entry);
            Ok(())
        })?
    }

    fn remove(&self, id: &str) -> Result<bool, GalleryError> {
        self.update(|entries| {
            let before = entries.len();
            entries.retain(|e| e.id != id);
            entries.len() != before
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Embedding;

    fn entry(identity: &str) -> GalleryEntry {
        GalleryEntry::new(identity, Embedding::new(vec![1.0, 0.0])).unwrap()
    }

    #[test]
    fn test_add_and_snapshot() {
        let gallery = InMemoryGallery::new();
        assert!(gallery.is_empty().unwrap());
        gallery.add(entry("Alice")).unwrap();
        gallery.add(entry("Bob")).unwrap();
        let snap = gallery.snapshot().unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].identity, "Alice");
        assert_eq!(snap[1].identity, "Bob");
    }

    #[test]
    fn test_snapshot_unaffected_by_later_writes() {
        let gallery = InMemoryGallery::new();
        gallery.add(entry("Alice")).unwrap();
        let before = gallery.snapshot().unwrap();
        gallery.add(entry("Bob")).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(gallery.len().unwrap(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let gallery = InMemoryGallery::new();
        let e = entry("Alice");
        gallery.add(e.clone()).unwrap();
        assert!(matches!(gallery.add(e), Err(GalleryError::DuplicateId(_))));
        assert_eq!(gallery.len().unwrap(), 1);
    }

    #[test]
    fn test_remove() {
        let e = entry("Alice");
        let id = e.id.clone();
        let gallery = InMemoryGallery::from_entries(vec![e, entry("Bob")]);
        assert!(gallery.remove(&id).unwrap());
        assert!(!gallery.remove(&id).unwrap());
        assert_eq!(gallery.identities().unwrap(), vec!["Bob".to_string()]);
    }

    #[test]
    fn test_identities_sorted_and_distinct() {
        let gallery = InMemoryGallery::from_entries(vec![entry("Carol"), entry("Alice"), entry("Carol")]);
        assert_eq!(gallery.identities().unwrap(), vec!["Alice".to_string(), "Carol".to_string()]);
    }
}
