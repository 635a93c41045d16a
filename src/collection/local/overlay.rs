use std::collections::BTreeSet;

use crate::collection::api::Snapshot;
use crate::collection::error::CollectionError;
use crate::collection::model::{newest_first, Document, DocumentId, FieldMap, Timestamp};
use crate::collection::remote::push_id::next_push_id;
use crate::collection::remote::{CreateAck, PatchAck};

/// Identifies one staged optimistic mutation within an overlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationKind {
    Add,
    Update,
    Remove,
}

#[derive(Clone, Debug, PartialEq)]
enum PendingOperation {
    Add {
        placeholder: DocumentId,
        fields: FieldMap,
        /// Ids present before the add could have landed; content matches only
        /// look past them. Taken from the first snapshot when staged before one.
        baseline: Option<BTreeSet<DocumentId>>,
    },
    Update {
        target: DocumentId,
        fields: FieldMap,
    },
    Remove {
        target: DocumentId,
    },
}

/// Server confirmation of a write, as reported by the remote store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Confirmation {
    Created(CreateAck),
    Patched(PatchAck),
    Erased,
}

/// A local write not yet confirmed by an authoritative snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingMutation {
    id: MutationId,
    operation: PendingOperation,
    local_time: Timestamp,
    confirmation: Option<Confirmation>,
}

impl PendingMutation {
    pub fn id(&self) -> MutationId {
        self.id
    }

    pub fn kind(&self) -> MutationKind {
        match self.operation {
            PendingOperation::Add { .. } => MutationKind::Add,
            PendingOperation::Update { .. } => MutationKind::Update,
            PendingOperation::Remove { .. } => MutationKind::Remove,
        }
    }

    /// Document the mutation targets; the placeholder (or, once known, the
    /// server-assigned id) for adds.
    pub fn target(&self) -> &DocumentId {
        match (&self.operation, &self.confirmation) {
            (PendingOperation::Add { .. }, Some(Confirmation::Created(ack))) => &ack.id,
            (PendingOperation::Add { placeholder, .. }, _) => placeholder,
            (PendingOperation::Update { target, .. }, _)
            | (PendingOperation::Remove { target }, _) => target,
        }
    }

    pub fn payload(&self) -> Option<&FieldMap> {
        match &self.operation {
            PendingOperation::Add { fields, .. } | PendingOperation::Update { fields, .. } => {
                Some(fields)
            }
            PendingOperation::Remove { .. } => None,
        }
    }

    /// Whether the server confirmed this write and `snapshot` already carries
    /// that confirmed state (or something newer).
    fn is_settled_by(&self, snapshot: &Snapshot) -> bool {
        match (&self.operation, &self.confirmation) {
            (_, None) => false,
            (PendingOperation::Add { .. }, Some(Confirmation::Created(ack))) => {
                snapshot.contains(&ack.id)
            }
            (PendingOperation::Update { target, .. }, Some(Confirmation::Patched(ack))) => {
                snapshot
                    .get(target)
                    .map(|document| document.updated_at() >= ack.updated_at)
                    .unwrap_or(true)
            }
            (PendingOperation::Remove { target }, Some(Confirmation::Erased)) => {
                !snapshot.contains(target)
            }
            (_, Some(_)) => self.shows_in(snapshot),
        }
    }

    /// Whether `snapshot` already shows this mutation's effect, by content.
    fn shows_in(&self, snapshot: &Snapshot) -> bool {
        match &self.operation {
            PendingOperation::Add {
                fields, baseline, ..
            } => baseline.as_ref().is_some_and(|baseline| {
                snapshot.iter().any(|document| {
                    !baseline.contains(document.id()) && document.contains_fields(fields)
                })
            }),
            PendingOperation::Update { target, fields } => snapshot
                .get(target)
                .map(|document| document.contains_fields(fields))
                .unwrap_or(false),
            PendingOperation::Remove { target } => !snapshot.contains(target),
        }
    }

    fn apply(&self, documents: &mut Vec<Document>) {
        match &self.operation {
            PendingOperation::Add { fields, .. } => {
                let document = Document::new(
                    self.target().clone(),
                    self.local_time,
                    self.local_time,
                    fields.clone(),
                );
                let position = documents.partition_point(|existing| {
                    newest_first(existing, &document) == std::cmp::Ordering::Less
                });
                documents.insert(position, document);
            }
            PendingOperation::Update { target, fields } => {
                if let Some(document) = documents.iter_mut().find(|d| d.id() == target) {
                    document.merge_fields(fields);
                    document.set_updated_at(self.local_time);
                }
            }
            PendingOperation::Remove { target } => {
                documents.retain(|document| document.id() != target);
            }
        }
    }
}

/// Event delivered to a subscriber when one of its optimistic writes was
/// rejected and rolled back. Carries the original payload for retry.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationFailed {
    pub kind: MutationKind,
    pub target: Option<DocumentId>,
    pub payload: Option<FieldMap>,
    pub error: CollectionError,
}

/// Local pending-mutation layer for one subscriber.
///
/// Staged writes are folded over the authoritative snapshot in staging order.
/// A pending mutation leaves the overlay when it is rejected, or once it is
/// confirmed and a snapshot carrying the confirmed state arrives; until then
/// the authoritative state never overrides it. An unconfirmed mutation whose
/// effect a snapshot already shows stays pending but is not applied twice.
#[derive(Debug, Default)]
pub struct OptimisticOverlay {
    pending: Vec<PendingMutation>,
    next_id: u64,
}

impl OptimisticOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn stage_add(&mut self, fields: FieldMap, base: Option<&Snapshot>) -> MutationId {
        let placeholder = DocumentId::placeholder(&next_push_id());
        self.push(PendingOperation::Add {
            placeholder,
            fields,
            baseline: base.map(baseline_of),
        })
    }

    pub fn stage_update(&mut self, target: DocumentId, fields: FieldMap) -> MutationId {
        self.push(PendingOperation::Update { target, fields })
    }

    pub fn stage_remove(&mut self, target: DocumentId) -> MutationId {
        self.push(PendingOperation::Remove { target })
    }

    /// Records the server confirmation of `id`.
    ///
    /// `current` is the latest authoritative snapshot; if it already carries
    /// the confirmed state the mutation is dropped right away, otherwise a
    /// later snapshot settles it.
    pub fn acknowledge(
        &mut self,
        id: MutationId,
        confirmation: Confirmation,
        current: Option<&Snapshot>,
    ) {
        let Some(index) = self.position(id) else {
            return;
        };
        self.pending[index].confirmation = Some(confirmation);
        if let Some(snapshot) = current {
            if self.pending[index].is_settled_by(snapshot) {
                self.pending.remove(index);
            }
        }
    }

    /// Drops a failed mutation, returning it if it was still pending.
    pub fn reject(&mut self, id: MutationId) -> Option<PendingMutation> {
        self.position(id).map(|index| self.pending.remove(index))
    }

    /// Settles pending mutations against a new authoritative snapshot and
    /// returns how many were dropped.
    pub fn reconcile(&mut self, snapshot: &Snapshot) -> usize {
        for mutation in &mut self.pending {
            if let PendingOperation::Add { baseline, .. } = &mut mutation.operation {
                if baseline.is_none() {
                    *baseline = Some(baseline_of(snapshot));
                }
            }
        }
        let before = self.pending.len();
        self.pending.retain(|mutation| !mutation.is_settled_by(snapshot));
        before - self.pending.len()
    }

    /// Authoritative documents with every pending mutation applied.
    pub fn apply(&self, base: &Snapshot) -> Vec<Document> {
        let mut documents = base.documents().to_vec();
        for mutation in &self.pending {
            if mutation.confirmation.is_none() && mutation.shows_in(base) {
                continue;
            }
            mutation.apply(&mut documents);
        }
        documents
    }

    fn push(&mut self, operation: PendingOperation) -> MutationId {
        self.next_id += 1;
        let id = MutationId(self.next_id);
        self.pending.push(PendingMutation {
            id,
            operation,
            local_time: Timestamp::now(),
            confirmation: None,
        });
        id
    }

    fn position(&self, id: MutationId) -> Option<usize> {
        self.pending.iter().position(|mutation| mutation.id == id)
    }
}

fn baseline_of(snapshot: &Snapshot) -> BTreeSet<DocumentId> {
    snapshot.iter().map(|document| document.id().clone()).collect()
}
