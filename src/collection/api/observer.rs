use std::fmt;
use std::sync::Arc;

use crate::collection::api::Snapshot;
use crate::collection::error::CollectionError;
use crate::collection::local::MutationFailed;

pub type SnapshotFn = Arc<dyn Fn(&Snapshot) + Send + Sync + 'static>;
pub type SnapshotErrorFn = Arc<dyn Fn(&CollectionError) + Send + Sync + 'static>;
pub type MutationFailedFn = Arc<dyn Fn(&MutationFailed) + Send + Sync + 'static>;

/// Callbacks registered against one subscriber.
///
/// `next` receives every snapshot version (and optimistic view) in order,
/// `error` receives upstream failures, `mutation_failed` receives rollbacks of
/// this subscriber's optimistic writes.
#[derive(Clone, Default)]
pub struct SnapshotObserver {
    pub next: Option<SnapshotFn>,
    pub error: Option<SnapshotErrorFn>,
    pub mutation_failed: Option<MutationFailedFn>,
}

impl SnapshotObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_next<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        self.next = Some(Arc::new(callback));
        self
    }

    pub fn with_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CollectionError) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(callback));
        self
    }

    pub fn with_mutation_failed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MutationFailed) + Send + Sync + 'static,
    {
        self.mutation_failed = Some(Arc::new(callback));
        self
    }

    pub(crate) fn notify_next(&self, snapshot: &Snapshot) {
        if let Some(callback) = &self.next {
            callback(snapshot);
        }
    }

    pub(crate) fn notify_error(&self, error: &CollectionError) {
        if let Some(callback) = &self.error {
            callback(error);
        }
    }

    pub(crate) fn notify_mutation_failed(&self, event: &MutationFailed) {
        if let Some(callback) = &self.mutation_failed {
            callback(event);
        }
    }
}

impl fmt::Debug for SnapshotObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotObserver")
            .field("next", &self.next.is_some())
            .field("error", &self.error.is_some())
            .field("mutation_failed", &self.mutation_failed.is_some())
            .finish()
    }
}

/// Handle identifying an observer registered on a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub(crate) u64);
