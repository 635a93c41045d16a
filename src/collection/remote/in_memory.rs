use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};

use crate::collection::error::{invalid_argument, not_found, CollectionError, CollectionResult};
use crate::collection::model::{
    newest_first, CollectionKey, Document, DocumentId, FieldMap, Timestamp, CREATED_AT_FIELD,
};
use crate::collection::remote::push_id::next_push_id;

use super::source::{
    CreateAck, EraseOutcome, OrderDirection, PatchAck, RemoteCollectionSource, SourceEvent,
    SourceStream,
};

/// Process-local remote store with push subscriptions.
///
/// Behaves like the hosted store as seen by the cache: ids and timestamps are
/// assigned here, every write pushes the full ordered collection to each live
/// subscription, and dropped subscription streams count as closed. Failure
/// injection hooks make transport and write errors reproducible.
#[derive(Clone, Default)]
pub struct InMemoryCollectionSource {
    inner: Arc<SourceInner>,
}

#[derive(Default)]
struct SourceInner {
    state: Mutex<SourceState>,
}

#[derive(Default)]
struct SourceState {
    collections: HashMap<CollectionKey, BTreeMap<DocumentId, Document>>,
    watchers: HashMap<CollectionKey, Vec<Watcher>>,
    counters: HashMap<CollectionKey, SubscriptionCounters>,
    last_server_time: Option<Timestamp>,
    subscribe_failures: VecDeque<CollectionError>,
    write_failures: VecDeque<CollectionError>,
}

struct Watcher {
    direction: OrderDirection,
    sender: async_channel::Sender<SourceEvent>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct SubscriptionCounters {
    opened: usize,
    closed: usize,
}

impl InMemoryCollectionSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of subscriptions ever opened for `collection`.
    pub fn subscribe_count(&self, collection: &CollectionKey) -> usize {
        self.counters(collection).opened
    }

    /// Number of subscription streams for `collection` that have been dropped.
    pub fn close_count(&self, collection: &CollectionKey) -> usize {
        self.counters(collection).closed
    }

    pub fn open_subscriptions(&self, collection: &CollectionKey) -> usize {
        let counters = self.counters(collection);
        counters.opened - counters.closed
    }

    /// Stored documents in snapshot order.
    pub fn documents(&self, collection: &CollectionKey) -> Vec<Document> {
        let state = self.lock();
        ordered(&state, collection, OrderDirection::Descending)
    }

    /// Makes the next `subscribe` call fail with `error`.
    pub fn fail_next_subscribe(&self, error: CollectionError) {
        self.lock().subscribe_failures.push_back(error);
    }

    /// Makes the next write (`create`, `put`, `patch` or `erase`) fail with `error`.
    pub fn fail_next_write(&self, error: CollectionError) {
        self.lock().write_failures.push_back(error);
    }

    /// Pushes `error` down every live subscription of `collection`.
    pub fn emit_error(&self, collection: &CollectionKey, error: CollectionError) {
        let state = self.lock();
        if let Some(watchers) = state.watchers.get(collection) {
            for watcher in watchers {
                let _ = watcher.sender.try_send(Err(error.clone()));
            }
        }
    }

    /// Ends every live subscription stream of `collection`, as a dropped connection would.
    pub fn disconnect(&self, collection: &CollectionKey) {
        let mut state = self.lock();
        if let Some(watchers) = state.watchers.remove(collection) {
            for watcher in watchers {
                watcher.sender.close();
            }
        }
    }

    fn counters(&self, collection: &CollectionKey) -> SubscriptionCounters {
        self.lock()
            .counters
            .get(collection)
            .copied()
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn take_write_failure(state: &mut SourceState) -> CollectionResult<()> {
        match state.write_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn write_document(
        &self,
        collection: &CollectionKey,
        id: DocumentId,
        fields: FieldMap,
    ) -> CollectionResult<CreateAck> {
        let mut state = self.lock();
        Self::take_write_failure(&mut state)?;
        let now = next_server_time(&mut state);
        let document = Document::new(id.clone(), now, now, fields);
        state
            .collections
            .entry(collection.clone())
            .or_default()
            .insert(id.clone(), document);
        broadcast(&mut state, collection);
        Ok(CreateAck {
            id,
            created_at: now,
        })
    }
}

fn next_server_time(state: &mut SourceState) -> Timestamp {
    let mut now = Timestamp::now();
    if let Some(last) = state.last_server_time {
        if now <= last {
            now = last.plus_nanos(1_000);
        }
    }
    state.last_server_time = Some(now);
    now
}

fn ordered(state: &SourceState, collection: &CollectionKey, direction: OrderDirection) -> Vec<Document> {
    let mut documents: Vec<Document> = state
        .collections
        .get(collection)
        .map(|documents| documents.values().cloned().collect())
        .unwrap_or_default();
    documents.sort_by(newest_first);
    if direction == OrderDirection::Ascending {
        documents.reverse();
    }
    documents
}

fn broadcast(state: &mut SourceState, collection: &CollectionKey) {
    let Some(mut watchers) = state.watchers.remove(collection) else {
        return;
    };
    watchers.retain(|watcher| {
        let documents = ordered(state, collection, watcher.direction);
        watcher.sender.try_send(Ok(documents)).is_ok()
    });
    if !watchers.is_empty() {
        state.watchers.insert(collection.clone(), watchers);
    }
}

fn check_order_field(order_field: &str) -> CollectionResult<()> {
    if order_field == CREATED_AT_FIELD {
        Ok(())
    } else {
        Err(invalid_argument(format!(
            "In-memory source only orders by \"{CREATED_AT_FIELD}\", got \"{order_field}\""
        )))
    }
}

/// Subscription stream handed to the cache; records its own closing.
struct WatchStream {
    events: BoxStream<'static, SourceEvent>,
    _guard: CloseGuard,
}

impl Stream for WatchStream {
    type Item = SourceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

struct CloseGuard {
    source: Weak<SourceInner>,
    collection: CollectionKey,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(source) = self.source.upgrade() {
            let mut state = source.state.lock().unwrap_or_else(PoisonError::into_inner);
            state
                .counters
                .entry(self.collection.clone())
                .or_default()
                .closed += 1;
        }
    }
}

#[async_trait]
impl RemoteCollectionSource for InMemoryCollectionSource {
    async fn subscribe(
        &self,
        collection: &CollectionKey,
        order_field: &str,
        direction: OrderDirection,
    ) -> CollectionResult<SourceStream> {
        check_order_field(order_field)?;
        let mut state = self.lock();
        if let Some(error) = state.subscribe_failures.pop_front() {
            return Err(error);
        }

        let (sender, receiver) = async_channel::unbounded();
        let initial = ordered(&state, collection, direction);
        let _ = sender.try_send(Ok(initial));
        state
            .watchers
            .entry(collection.clone())
            .or_default()
            .push(Watcher { direction, sender });
        state
            .counters
            .entry(collection.clone())
            .or_default()
            .opened += 1;

        let stream = WatchStream {
            events: receiver.boxed(),
            _guard: CloseGuard {
                source: Arc::downgrade(&self.inner),
                collection: collection.clone(),
            },
        };
        Ok(stream.boxed())
    }

    async fn fetch(
        &self,
        collection: &CollectionKey,
        order_field: &str,
        direction: OrderDirection,
    ) -> CollectionResult<Vec<Document>> {
        check_order_field(order_field)?;
        Ok(ordered(&self.lock(), collection, direction))
    }

    async fn create(
        &self,
        collection: &CollectionKey,
        fields: FieldMap,
    ) -> CollectionResult<CreateAck> {
        let id = DocumentId::from_server(next_push_id());
        self.write_document(collection, id, fields)
    }

    async fn put(
        &self,
        collection: &CollectionKey,
        id: &DocumentId,
        fields: FieldMap,
    ) -> CollectionResult<CreateAck> {
        self.write_document(collection, id.clone(), fields)
    }

    async fn patch(
        &self,
        collection: &CollectionKey,
        id: &DocumentId,
        fields: FieldMap,
    ) -> CollectionResult<PatchAck> {
        let mut state = self.lock();
        Self::take_write_failure(&mut state)?;
        let now = next_server_time(&mut state);
        let document = state
            .collections
            .get_mut(collection)
            .and_then(|documents| documents.get_mut(id))
            .ok_or_else(|| not_found(format!("Document {collection}/{id} does not exist")))?;
        document.merge_fields(&fields);
        document.set_updated_at(now);
        broadcast(&mut state, collection);
        Ok(PatchAck { updated_at: now })
    }

    async fn erase(
        &self,
        collection: &CollectionKey,
        id: &DocumentId,
    ) -> CollectionResult<EraseOutcome> {
        let mut state = self.lock();
        Self::take_write_failure(&mut state)?;
        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|documents| documents.remove(id));
        match removed {
            Some(_) => {
                broadcast(&mut state, collection);
                Ok(EraseOutcome::Erased)
            }
            None => Ok(EraseOutcome::NotFoundIgnored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::error::{unavailable, CollectionErrorCode};
    use crate::collection::model::fields_from_json;
    use serde_json::json;

    fn reviews() -> CollectionKey {
        CollectionKey::new("reviews").unwrap()
    }

    #[tokio::test]
    async fn subscription_receives_initial_and_write_states() {
        let source = InMemoryCollectionSource::new();
        let mut stream = source
            .subscribe(&reviews(), CREATED_AT_FIELD, OrderDirection::Descending)
            .await
            .unwrap();

        let initial = stream.next().await.unwrap().unwrap();
        assert!(initial.is_empty());

        let fields = fields_from_json(json!({ "name": "Dana", "rating": 5 })).unwrap();
        let ack = source.create(&reviews(), fields).await.unwrap();

        let after_add = stream.next().await.unwrap().unwrap();
        assert_eq!(after_add.len(), 1);
        assert_eq!(after_add[0].id(), &ack.id);
        assert_eq!(after_add[0].created_at(), ack.created_at);
    }

    #[tokio::test]
    async fn server_times_are_strictly_increasing() {
        let source = InMemoryCollectionSource::new();
        let first = source.create(&reviews(), FieldMap::new()).await.unwrap();
        let second = source.create(&reviews(), FieldMap::new()).await.unwrap();
        assert!(second.created_at > first.created_at);

        let documents = source.documents(&reviews());
        assert_eq!(documents[0].id(), &second.id);
    }

    #[tokio::test]
    async fn patch_missing_document_is_not_found() {
        let source = InMemoryCollectionSource::new();
        let id = DocumentId::new("missing").unwrap();
        let err = source
            .patch(&reviews(), &id, FieldMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, CollectionErrorCode::NotFound);
    }

    #[tokio::test]
    async fn erase_is_idempotent() {
        let source = InMemoryCollectionSource::new();
        let ack = source.create(&reviews(), FieldMap::new()).await.unwrap();
        assert_eq!(
            source.erase(&reviews(), &ack.id).await.unwrap(),
            EraseOutcome::Erased
        );
        assert_eq!(
            source.erase(&reviews(), &ack.id).await.unwrap(),
            EraseOutcome::NotFoundIgnored
        );
    }

    #[tokio::test]
    async fn dropping_stream_counts_as_close() {
        let source = InMemoryCollectionSource::new();
        let stream = source
            .subscribe(&reviews(), CREATED_AT_FIELD, OrderDirection::Descending)
            .await
            .unwrap();
        assert_eq!(source.open_subscriptions(&reviews()), 1);
        drop(stream);
        assert_eq!(source.close_count(&reviews()), 1);
        assert_eq!(source.open_subscriptions(&reviews()), 0);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_once() {
        let source = InMemoryCollectionSource::new();
        source.fail_next_write(unavailable("offline"));
        assert!(source.create(&reviews(), FieldMap::new()).await.is_err());
        assert!(source.create(&reviews(), FieldMap::new()).await.is_ok());

        source.fail_next_subscribe(unavailable("offline"));
        assert!(source
            .subscribe(&reviews(), CREATED_AT_FIELD, OrderDirection::Descending)
            .await
            .is_err());
        assert_eq!(source.subscribe_count(&reviews()), 0);
    }

    #[tokio::test]
    async fn emit_error_and_disconnect_reach_subscribers() {
        let source = InMemoryCollectionSource::new();
        let mut stream = source
            .subscribe(&reviews(), CREATED_AT_FIELD, OrderDirection::Descending)
            .await
            .unwrap();
        stream.next().await.unwrap().unwrap();

        source.emit_error(&reviews(), unavailable("transport reset"));
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code, CollectionErrorCode::Unavailable);

        source.disconnect(&reviews());
        assert!(stream.next().await.is_none());
    }
}
