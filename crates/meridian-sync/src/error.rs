//! Synchronization error types.

use thiserror::Error;

use meridian_world::SessionId;

use crate::compact::CompactId;
use crate::resource::IdSpace;

/// Failures of per-session synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A client named a compact id it was never given.
    #[error("unknown compact id {compact:?} in {space:?}")]
    UnknownCompactId {
        space: IdSpace,
        compact: CompactId,
    },
    /// The session ran out of compact ids in a category.
    #[error("compact id space exhausted in {space:?}")]
    CompactIdExhausted { space: IdSpace },
    #[error("unknown session {0:?}")]
    UnknownSession(SessionId),
    /// A region or one of its members disappeared while being synchronized.
    #[error("{0} is no longer resident")]
    Missing(String),
    #[error("failed to encode record: {0}")]
    Record(#[from] postcard::Error),
}

/// Failures decoding an outgoing record.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The payload was empty (no version byte).
    #[error("empty payload, no version byte")]
    EmptyPayload,
    #[error("unsupported record version: {0}")]
    UnsupportedVersion(u8),
    #[error("deserialization error: {0}")]
    Postcard(#[from] postcard::Error),
}
