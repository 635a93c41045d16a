use std::sync::Arc;

use crate::collection::model::{CollectionKey, Document, DocumentId};

/// Metadata about how a snapshot relates to the authoritative server state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    has_pending_writes: bool,
    stale: bool,
}

impl SnapshotMetadata {
    pub fn new(has_pending_writes: bool, stale: bool) -> Self {
        Self {
            has_pending_writes,
            stale,
        }
    }

    /// Indicates whether optimistic local mutations are folded into the documents.
    pub fn has_pending_writes(&self) -> bool {
        self.has_pending_writes
    }

    /// Indicates whether the upstream subscription failed after this state was received.
    pub fn is_stale(&self) -> bool {
        self.stale
    }
}

/// Ordered state of one collection at a given version, newest document first.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    key: CollectionKey,
    version: u64,
    documents: Arc<Vec<Document>>,
    metadata: SnapshotMetadata,
}

impl Snapshot {
    pub(crate) fn new(
        key: CollectionKey,
        version: u64,
        documents: Arc<Vec<Document>>,
        metadata: SnapshotMetadata,
    ) -> Self {
        Self {
            key,
            version,
            documents,
            metadata,
        }
    }

    pub fn key(&self) -> &CollectionKey {
        &self.key
    }

    /// Upstream version this state was derived from; starts at 1.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Document> {
        self.documents.iter()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn get(&self, id: &DocumentId) -> Option<&Document> {
        self.documents.iter().find(|document| document.id() == id)
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.get(id).is_some()
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn has_pending_writes(&self) -> bool {
        self.metadata.has_pending_writes()
    }

    pub fn is_stale(&self) -> bool {
        self.metadata.is_stale()
    }

    /// Same version, different contents: the view one subscriber observes.
    pub(crate) fn with_documents(&self, documents: Vec<Document>, has_pending_writes: bool) -> Self {
        Self {
            key: self.key.clone(),
            version: self.version,
            documents: Arc::new(documents),
            metadata: SnapshotMetadata::new(has_pending_writes, self.metadata.is_stale()),
        }
    }

    pub(crate) fn with_stale(&self, stale: bool) -> Self {
        Self {
            metadata: SnapshotMetadata::new(self.metadata.has_pending_writes(), stale),
            ..self.clone()
        }
    }
}

/// Result of a synchronous read of a collection's latest known state.
#[derive(Clone, Debug, PartialEq)]
pub enum SnapshotState {
    NotYetLoaded,
    Loaded(Snapshot),
}

impl SnapshotState {
    pub fn is_loaded(&self) -> bool {
        matches!(self, SnapshotState::Loaded(_))
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            SnapshotState::Loaded(snapshot) => Some(snapshot),
            SnapshotState::NotYetLoaded => None,
        }
    }

    pub fn into_snapshot(self) -> Option<Snapshot> {
        match self {
            SnapshotState::Loaded(snapshot) => Some(snapshot),
            SnapshotState::NotYetLoaded => None,
        }
    }
}

impl From<Option<Snapshot>> for SnapshotState {
    fn from(value: Option<Snapshot>) -> Self {
        match value {
            Some(snapshot) => SnapshotState::Loaded(snapshot),
            None => SnapshotState::NotYetLoaded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::model::{FieldMap, Timestamp};

    fn sample() -> Snapshot {
        let key = CollectionKey::new("reviews").unwrap();
        let at = Timestamp::from_millis(10);
        let document = Document::new(DocumentId::new("r1").unwrap(), at, at, FieldMap::new());
        Snapshot::new(key, 3, Arc::new(vec![document]), SnapshotMetadata::default())
    }

    #[test]
    fn metadata_flags() {
        let meta = SnapshotMetadata::new(true, false);
        assert!(meta.has_pending_writes());
        assert!(!meta.is_stale());
    }

    #[test]
    fn lookups_by_id() {
        let snapshot = sample();
        assert!(snapshot.contains(&DocumentId::new("r1").unwrap()));
        assert!(!snapshot.contains(&DocumentId::new("r2").unwrap()));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn view_keeps_version() {
        let snapshot = sample();
        let view = snapshot.with_documents(Vec::new(), true);
        assert_eq!(view.version(), 3);
        assert!(view.is_empty());
        assert!(view.has_pending_writes());
        assert!(sample().with_stale(true).is_stale());
    }

    #[test]
    fn state_reports_loading() {
        assert!(!SnapshotState::NotYetLoaded.is_loaded());
        let state = SnapshotState::from(Some(sample()));
        assert_eq!(state.snapshot().map(Snapshot::version), Some(3));
    }
}
