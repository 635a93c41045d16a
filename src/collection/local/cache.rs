use std::collections::HashSet;
use std::sync::Arc;

use crate::collection::api::{Snapshot, SnapshotMetadata, SnapshotState};
use crate::collection::model::{newest_first, CollectionKey, Document};

/// Ordered mirror of one remote collection.
///
/// Only upstream events replace its contents. Every replacement bumps the
/// version, so two readers holding the same version hold the same documents.
#[derive(Debug)]
pub struct SnapshotCache {
    key: CollectionKey,
    version: u64,
    current: Option<Snapshot>,
}

impl SnapshotCache {
    pub fn new(key: CollectionKey) -> Self {
        Self {
            key,
            version: 0,
            current: None,
        }
    }

    /// Version of the latest snapshot, `0` before the first upstream event.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_loaded(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&Snapshot> {
        self.current.as_ref()
    }

    pub fn state(&self) -> SnapshotState {
        SnapshotState::from(self.current.clone())
    }

    /// Installs a new upstream state and returns it as the next version.
    pub fn replace(&mut self, documents: Vec<Document>) -> Snapshot {
        self.version += 1;
        let documents = normalize(&self.key, documents);
        let snapshot = Snapshot::new(
            self.key.clone(),
            self.version,
            Arc::new(documents),
            SnapshotMetadata::default(),
        );
        self.current = Some(snapshot.clone());
        snapshot
    }

    /// Flags the held state as stale after an upstream failure, keeping it readable.
    pub fn mark_stale(&mut self) {
        if let Some(current) = self.current.as_mut() {
            *current = current.with_stale(true);
        }
    }
}

fn normalize(key: &CollectionKey, mut documents: Vec<Document>) -> Vec<Document> {
    documents.sort_by(newest_first);
    let mut seen = HashSet::with_capacity(documents.len());
    let before = documents.len();
    documents.retain(|document| seen.insert(document.id().clone()));
    if documents.len() != before {
        log::warn!(
            "dropped {} duplicate document ids from upstream snapshot of {key}",
            before - documents.len()
        );
    }
    documents
}
