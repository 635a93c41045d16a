mod in_memory;
pub(crate) mod push_id;
mod source;

pub use in_memory::InMemoryCollectionSource;
pub use source::{
    CreateAck, EraseOutcome, OrderDirection, PatchAck, RemoteCollectionSource,
    RemoteCollectionSourceArc, SourceEvent, SourceStream,
};
