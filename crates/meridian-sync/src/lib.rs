//! Interest management and incremental state sync.
//!
//! Sessions look at the world through view circles. The crate works out which
//! regions, chunks and entities each session can see, and streams the
//! differences as compact, versioned records.

pub mod compact;
pub mod error;
pub mod record;
pub mod redirect;
pub mod resource;
pub mod server;
pub mod session;
pub mod subscription;
pub mod synchronizer;
pub mod transport;
pub mod view;

pub use compact::{CompactId, CompactIdAllocator, Exhausted};
pub use error::{RecordError, SyncError};
pub use record::{CompactNode, CompactVoxelCube, RECORD_VERSION, Record};
pub use redirect::RedirectTable;
pub use resource::{Acquired, IdSpace, ResourceTable, ResourceUse};
pub use server::{SyncConfig, SyncServer, TickReport};
pub use session::{Anchor, Session};
pub use subscription::{EventSink, SubscriptionEvent, SubscriptionTracker, VisitReport};
pub use synchronizer::{SessionSynchronizer, SyncSink};
pub use transport::{RecordingTransport, Transport};
pub use view::{
    BridgeGraph, BridgeId, ContentBridge, ViewCircle, VisibilityPropagator, chunk_visible,
    covered_regions, entity_visible,
};
