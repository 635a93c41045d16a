mod gateway;
mod live;
mod observer;
mod seed;
mod snapshot;

pub use gateway::MutationGateway;
pub use live::{CollectionClient, LiveCollection, UseCollectionOptions};
pub use observer::{
    MutationFailedFn, ObserverId, SnapshotErrorFn, SnapshotFn, SnapshotObserver,
};
pub use seed::{CollectionSeeder, SeedDocument, SeedOutcome};
pub use snapshot::{Snapshot, SnapshotMetadata, SnapshotState};
