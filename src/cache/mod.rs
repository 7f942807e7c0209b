//! Caching primitives shared by every loader.
//!
//! This module provides the building blocks the feed, profile and image
//! loaders are assembled from:
//! - single-flight request de-duplication ([`RequestMemoizer`])
//! - a capacity- and TTL-bounded LRU ([`BoundedTtlCache`])
//! - a FIFO concurrency gate ([`ConcurrencyGate`])
//! - a bounded linear retry policy ([`BackoffPolicy`])
//! - persisted, namespaced snapshots ([`SnapshotCache`] over a [`SnapshotStore`])

mod backoff;
mod gate;
mod memo;
mod snapshot;
mod storage;
mod ttl;

pub use backoff::BackoffPolicy;
pub use gate::{ConcurrencyGate, GatePermit};
pub use memo::RequestMemoizer;
pub use snapshot::{Namespace, SnapshotCache};
pub use storage::{
  MemorySnapshotStore, NoopSnapshotStore, SnapshotStore, SqliteSnapshotStore, StoredSnapshot,
};
pub use ttl::BoundedTtlCache;
