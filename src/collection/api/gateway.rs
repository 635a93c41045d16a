use std::future::Future;

use futures::channel::oneshot;

use crate::collection::error::{cancelled, invalid_argument, CollectionResult};
use crate::collection::model::{validate_payload, CollectionKey, DocumentId, FieldMap};
use crate::collection::remote::{CreateAck, EraseOutcome, PatchAck, RemoteCollectionSourceArc};
use crate::platform::runtime;

/// Applies writes against the remote store and reports each outcome.
///
/// The gateway never assigns ids or timestamps. Every round-trip runs on a
/// detached task: dropping the returned future abandons the result, not the
/// write.
#[derive(Clone)]
pub struct MutationGateway {
    source: RemoteCollectionSourceArc,
}

impl MutationGateway {
    pub fn new(source: RemoteCollectionSourceArc) -> Self {
        Self { source }
    }

    /// Creates a document and returns the id the remote store assigned.
    pub async fn add(&self, key: &CollectionKey, fields: FieldMap) -> CollectionResult<DocumentId> {
        self.add_with_ack(key, fields).await.map(|ack| ack.id)
    }

    pub async fn add_with_ack(
        &self,
        key: &CollectionKey,
        fields: FieldMap,
    ) -> CollectionResult<CreateAck> {
        validate_payload(&fields)?;
        let source = self.source.clone();
        let key = key.clone();
        log::debug!("adding document to {key}");
        run_to_completion(async move {
            match source.create(&key, fields).await {
                Ok(ack) => {
                    log::debug!("added document {} to {key}", ack.id);
                    Ok(ack)
                }
                Err(err) => {
                    log::warn!("add to {key} failed: {err}");
                    Err(err)
                }
            }
        })
        .await
    }

    /// Replaces the given fields of `id`. Fails with `NotFound` when it is absent.
    pub async fn update(
        &self,
        key: &CollectionKey,
        id: &DocumentId,
        fields: FieldMap,
    ) -> CollectionResult<()> {
        self.update_with_ack(key, id, fields).await.map(|_| ())
    }

    pub async fn update_with_ack(
        &self,
        key: &CollectionKey,
        id: &DocumentId,
        fields: FieldMap,
    ) -> CollectionResult<PatchAck> {
        if fields.is_empty() {
            return Err(invalid_argument("Update payload must not be empty"));
        }
        validate_payload(&fields)?;
        let source = self.source.clone();
        let (key, id) = (key.clone(), id.clone());
        log::debug!("updating {key}/{id}");
        run_to_completion(async move {
            let result = source.patch(&key, &id, fields).await;
            if let Err(err) = &result {
                log::warn!("update of {key}/{id} failed: {err}");
            }
            result
        })
        .await
    }

    /// Deletes `id`. Removing a document that is already gone succeeds.
    pub async fn remove(&self, key: &CollectionKey, id: &DocumentId) -> CollectionResult<()> {
        let source = self.source.clone();
        let (key, id) = (key.clone(), id.clone());
        log::debug!("removing {key}/{id}");
        run_to_completion(async move {
            match source.erase(&key, &id).await {
                Ok(EraseOutcome::Erased) => Ok(()),
                Ok(EraseOutcome::NotFoundIgnored) => {
                    log::debug!("{key}/{id} was already absent");
                    Ok(())
                }
                Err(err) => {
                    log::warn!("remove of {key}/{id} failed: {err}");
                    Err(err)
                }
            }
        })
        .await
    }
}

/// Runs `operation` on a detached task and waits for its result.
async fn run_to_completion<T, F>(operation: F) -> CollectionResult<T>
where
    T: Send + 'static,
    F: Future<Output = CollectionResult<T>> + Send + 'static,
{
    let (sender, receiver) = oneshot::channel();
    runtime::spawn_detached(async move {
        let _ = sender.send(operation.await);
    });
    receiver
        .await
        .unwrap_or_else(|_| Err(cancelled("Mutation task ended before reporting a result")))
}
