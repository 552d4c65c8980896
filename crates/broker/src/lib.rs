#![forbid(unsafe_code)]

mod fetch;
mod purgatory;
mod replica;

pub use fetch::{
    DelayedFetch, FetchCallback, FetchError, FetchMetadata, FetchPartitionData,
    FetchPartitionStatus, FetchResponse, PartitionFetchInfo, ReplicaView,
};
pub use purgatory::{DelayedOperation, Purgatory};
pub use replica::LocalReplicaManager;
