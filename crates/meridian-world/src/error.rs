//! World and persistence error types.

use thiserror::Error;

use crate::coords::{RegionPos, WorldId};

/// Failures reported by a [`RegionStore`](crate::store::RegionStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("region store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode region: {0}")]
    Encode(#[source] postcard::Error),
    #[error("failed to decode region: {0}")]
    Decode(#[source] postcard::Error),
    #[error("corrupt region data: {0}")]
    Corrupt(String),
}

/// Failures of region registry operations.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Loading failed recently; retried after the back-off elapses.
    #[error("region {region} in world {world:?} is unavailable")]
    RegionUnavailable { world: WorldId, region: RegionPos },
    /// The per-tick load budget is spent.
    #[error("region {region} in world {world:?} is waiting for a load slot")]
    RegionPending { world: WorldId, region: RegionPos },
    /// The region still has subscribers and must stay resident.
    #[error("region {region} in world {world:?} is observed")]
    RegionObserved { world: WorldId, region: RegionPos },
    /// Every entity slot is taken.
    #[error("region {region} in world {world:?} has no free entity slot")]
    RegionFull { world: WorldId, region: RegionPos },
    #[error(transparent)]
    Store(#[from] StoreError),
}
