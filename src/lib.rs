//! feedcore - client-side caching and pagination engine
//!
//! Sits between a social client's screens and its backends: a paged record
//! store, an image gateway that wants signed URLs, and a local snapshot store.
//!
//! - `cache`: single-flight memoizer, TTL/LRU cache, concurrency gate,
//!   backoff policy and persisted snapshots
//! - `feed`: the cursor-paginated activity feed with read-ahead
//! - `images`: signed image URL resolution
//! - `profile`: profile/grid/backlog bundles
//! - `backend`: the external collaborators and their HTTP clients

pub mod backend;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod feed;
pub mod images;
pub mod logging;
pub mod profile;
pub mod session;

#[cfg(test)]
mod testing;

pub use context::AppContext;
pub use error::LoadError;
pub use feed::{FeedEntry, FeedPager, FeedView, Phase};
pub use images::{Dimensions, SignedUrlResolver};
pub use profile::{ProfileBundleLoader, ProfileSnapshot};
pub use session::Session;
