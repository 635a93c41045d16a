//! Live, reference-counted mirrors of remote document collections.
//!
//! A [`CollectionClient`] hands out [`LiveCollection`]s. Every consumer of the
//! same collection name shares one upstream subscription and one ordered
//! snapshot cache, and may preview its own writes through an optimistic
//! overlay until the remote store confirms or rejects them.

pub mod api;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;

pub use api::{
    CollectionClient, CollectionSeeder, LiveCollection, MutationGateway, ObserverId, SeedDocument,
    SeedOutcome, Snapshot, SnapshotMetadata, SnapshotObserver, SnapshotState,
    UseCollectionOptions,
};
pub use error::{CollectionError, CollectionErrorCode, CollectionResult, SourceError, WriteError};
pub use local::{
    Confirmation, MultiplexerSettings, MutationFailed, MutationKind, Subscriber,
    SubscriptionMultiplexer,
};
pub use model::{CollectionKey, Document, DocumentId, FieldMap, Timestamp};
pub use remote::{InMemoryCollectionSource, RemoteCollectionSource};
