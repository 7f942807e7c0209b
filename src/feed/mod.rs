//! Cursor-paginated activity feed with read-ahead.

pub mod entry;
pub mod page;
pub mod pager;

pub use entry::{Actor, FeedEntry, Projections, RefSummary};
pub use page::{FeedPage, PageFetcher};
pub use pager::{FeedPager, FeedView};

use serde::Serialize;

/// What a [`FeedPager`] is doing right now. Exactly one phase at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
  /// Nothing loaded yet
  Idle,
  /// Reading the persisted snapshot
  Hydrating,
  /// Settled; any operation may start
  Hydrated,
  Refreshing,
  Prefetching,
  LoadingMore,
}
