use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::collection::error::CollectionResult;
use crate::collection::model::{CollectionKey, Document, DocumentId, FieldMap, Timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

/// One push from an upstream subscription: the full ordered collection or a failure.
pub type SourceEvent = CollectionResult<Vec<Document>>;

/// Live stream of collection states. Dropping it closes the subscription.
pub type SourceStream = BoxStream<'static, SourceEvent>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateAck {
    pub id: DocumentId,
    pub created_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchAck {
    pub updated_at: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EraseOutcome {
    Erased,
    NotFoundIgnored,
}

/// Remote document store consumed by the cache layer.
///
/// Implementations assign document ids and both timestamps; callers never do.
#[async_trait]
pub trait RemoteCollectionSource: Send + Sync + 'static {
    /// Opens a push subscription ordered by `order_field`.
    async fn subscribe(
        &self,
        collection: &CollectionKey,
        order_field: &str,
        direction: OrderDirection,
    ) -> CollectionResult<SourceStream>;

    /// One-shot ordered read of the whole collection.
    async fn fetch(
        &self,
        collection: &CollectionKey,
        order_field: &str,
        direction: OrderDirection,
    ) -> CollectionResult<Vec<Document>>;

    async fn create(&self, collection: &CollectionKey, fields: FieldMap)
        -> CollectionResult<CreateAck>;

    /// Creates or overwrites the document stored under `id`.
    async fn put(
        &self,
        collection: &CollectionKey,
        id: &DocumentId,
        fields: FieldMap,
    ) -> CollectionResult<CreateAck>;

    /// Replaces the given fields; fails with `NotFound` when `id` is absent.
    async fn patch(
        &self,
        collection: &CollectionKey,
        id: &DocumentId,
        fields: FieldMap,
    ) -> CollectionResult<PatchAck>;

    async fn erase(&self, collection: &CollectionKey, id: &DocumentId)
        -> CollectionResult<EraseOutcome>;
}

pub type RemoteCollectionSourceArc = Arc<dyn RemoteCollectionSource>;
