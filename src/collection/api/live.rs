use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::channel::oneshot;
use serde::de::DeserializeOwned;

use crate::collection::api::{
    MutationGateway, ObserverId, Snapshot, SnapshotObserver, SnapshotState,
};
use crate::collection::error::{CollectionError, CollectionResult};
use crate::collection::local::{
    Confirmation, MultiplexerSettings, MutationId, Subscriber, SubscriptionMultiplexer,
};
use crate::collection::model::{validate_payload, CollectionKey, Document, DocumentId, FieldMap};
use crate::collection::remote::RemoteCollectionSourceArc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UseCollectionOptions {
    /// Show this consumer's writes before the server confirms them.
    pub optimistic: bool,
}

impl Default for UseCollectionOptions {
    fn default() -> Self {
        Self { optimistic: true }
    }
}

impl UseCollectionOptions {
    pub fn with_optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }
}

/// Entry point for consumers of live collections.
///
/// Owns one [`SubscriptionMultiplexer`] and one [`MutationGateway`] over the
/// injected remote source. Clones share both.
#[derive(Clone)]
pub struct CollectionClient {
    multiplexer: SubscriptionMultiplexer,
    gateway: MutationGateway,
}

impl CollectionClient {
    pub fn new(source: RemoteCollectionSourceArc) -> Self {
        Self::with_settings(source, MultiplexerSettings::default())
    }

    pub fn with_settings(source: RemoteCollectionSourceArc, settings: MultiplexerSettings) -> Self {
        Self {
            multiplexer: SubscriptionMultiplexer::with_settings(source.clone(), settings),
            gateway: MutationGateway::new(source),
        }
    }

    pub fn multiplexer(&self) -> &SubscriptionMultiplexer {
        &self.multiplexer
    }

    pub fn gateway(&self) -> &MutationGateway {
        &self.gateway
    }

    /// Attaches to `name` with optimistic writes enabled.
    pub fn use_collection(&self, name: &str) -> CollectionResult<LiveCollection> {
        self.use_collection_with(name, UseCollectionOptions::default())
    }

    pub fn use_collection_with(
        &self,
        name: &str,
        options: UseCollectionOptions,
    ) -> CollectionResult<LiveCollection> {
        let key = CollectionKey::new(name)?;
        let subscriber = if options.optimistic {
            self.multiplexer.attach_with_overlay(key)
        } else {
            self.multiplexer.attach(key)
        };
        Ok(LiveCollection {
            subscriber,
            gateway: self.gateway.clone(),
        })
    }
}

impl fmt::Debug for CollectionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionClient")
            .field("multiplexer", &self.multiplexer)
            .finish()
    }
}

/// One consumer's live view of a collection: items, loading flag, last error
/// and the write operations.
///
/// Dropping it detaches from the multiplexer.
pub struct LiveCollection {
    subscriber: Subscriber,
    gateway: MutationGateway,
}

impl LiveCollection {
    pub fn key(&self) -> &CollectionKey {
        self.subscriber.key()
    }

    /// Documents newest first, including this consumer's pending writes.
    pub fn items(&self) -> Vec<Document> {
        self.snapshot()
            .map(|snapshot| snapshot.documents().to_vec())
            .unwrap_or_default()
    }

    /// Decodes every item into `T`, with the document id under `id`.
    pub fn items_as<T: DeserializeOwned>(&self) -> CollectionResult<Vec<T>> {
        self.items().iter().map(|document| document.decode()).collect()
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        self.subscriber.view().into_snapshot()
    }

    pub fn state(&self) -> SnapshotState {
        self.subscriber.view()
    }

    /// `true` until the first snapshot or the first error arrives.
    pub fn loading(&self) -> bool {
        !self.subscriber.current_snapshot().is_loaded() && self.subscriber.last_error().is_none()
    }

    pub fn error(&self) -> Option<CollectionError> {
        self.subscriber.last_error()
    }

    pub fn has_pending_writes(&self) -> bool {
        self.subscriber.pending_mutations() > 0
    }

    pub fn on_change(&self, observer: SnapshotObserver) -> ObserverId {
        self.subscriber.on_update(observer)
    }

    pub fn remove_observer(&self, observer: ObserverId) -> bool {
        self.subscriber.remove_observer(observer)
    }

    /// Creates a document and returns its server-assigned id.
    ///
    /// With the optimistic overlay the item is visible under a placeholder id
    /// right away and is replaced by the confirmed document without
    /// duplication.
    pub async fn add(&self, fields: FieldMap) -> CollectionResult<DocumentId> {
        validate_payload(&fields)?;
        let pending = self
            .subscriber
            .stage(|overlay, base| overlay.stage_add(fields.clone(), base));
        let result = self.gateway.add_with_ack(self.key(), fields).await;
        self.settle(pending, result, |ack| Confirmation::Created(ack.clone()))
            .map(|ack| ack.id)
    }

    pub async fn update(&self, id: &DocumentId, fields: FieldMap) -> CollectionResult<()> {
        if fields.is_empty() {
            return self.gateway.update(self.key(), id, fields).await;
        }
        validate_payload(&fields)?;
        let pending = self
            .subscriber
            .stage(|overlay, _| overlay.stage_update(id.clone(), fields.clone()));
        let result = self.gateway.update_with_ack(self.key(), id, fields).await;
        self.settle(pending, result, |ack| Confirmation::Patched(ack.clone()))
            .map(|_| ())
    }

    /// Deletes a document; deleting one that is already gone succeeds.
    pub async fn remove(&self, id: &DocumentId) -> CollectionResult<()> {
        let pending = self
            .subscriber
            .stage(|overlay, _| overlay.stage_remove(id.clone()));
        let result = self.gateway.remove(self.key(), id).await;
        self.settle(pending, result, |_| Confirmation::Erased)
    }

    /// Releases this consumer. Equivalent to dropping it.
    pub fn close(self) {
        drop(self);
    }

    /// Resolves once the first snapshot or the first upstream error arrives.
    pub async fn wait_until_loaded(&self) {
        if !self.loading() {
            return;
        }
        let (sender, receiver) = oneshot::channel::<()>();
        let sender = Arc::new(Mutex::new(Some(sender)));
        let on_error = sender.clone();
        let observer = self.on_change(
            SnapshotObserver::new()
                .with_next(move |_| resolve(&sender))
                .with_error(move |_| resolve(&on_error)),
        );
        if self.loading() {
            let _ = receiver.await;
        }
        self.remove_observer(observer);
    }

    /// Confirms or rolls back `pending` according to the remote outcome.
    fn settle<T>(
        &self,
        pending: Option<MutationId>,
        result: CollectionResult<T>,
        confirm: impl FnOnce(&T) -> Confirmation,
    ) -> CollectionResult<T> {
        let Some(mutation) = pending else {
            return result;
        };
        match &result {
            Ok(value) => self.subscriber.acknowledge(mutation, confirm(value)),
            Err(err) => self.subscriber.reject(mutation, err.clone()),
        }
        result
    }
}

fn resolve(sender: &Mutex<Option<oneshot::Sender<()>>>) {
    let mut sender = sender.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(sender) = sender.take() {
        let _ = sender.send(());
    }
}

impl fmt::Debug for LiveCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveCollection")
            .field("subscriber", &self.subscriber)
            .finish()
    }
}
