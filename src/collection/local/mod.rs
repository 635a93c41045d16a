mod cache;
mod multiplexer;
mod overlay;
mod pump;

pub use cache::SnapshotCache;
pub use multiplexer::{
    MultiplexerSettings, Subscriber, SubscriptionMultiplexer, DEFAULT_GRACE_PERIOD,
};
pub use overlay::{
    Confirmation, MutationFailed, MutationId, MutationKind, OptimisticOverlay, PendingMutation,
};
