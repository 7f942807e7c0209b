//! Typed, namespaced view over a [`SnapshotStore`].
//!
//! Every namespace carries its own freshness window. Reads of an expired
//! snapshot behave as a miss and drop the stored copy. Writes are
//! best-effort: callers get a [`LoadError::CacheWrite`] they are expected to
//! log and swallow.

use chrono::{Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::SnapshotStore;
use crate::error::LoadError;

/// Persisted snapshot namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
  Profile,
  GridPreview,
  GridItems,
  BacklogItems,
  FeedEntries,
  /// Signed image URLs; each entry carries its own expiry
  SignedUrls,
}

impl Namespace {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Profile => "profile",
      Self::GridPreview => "grid_items_preview",
      Self::GridItems => "grid_items",
      Self::BacklogItems => "backlog_items",
      Self::FeedEntries => "feed_entries",
      Self::SignedUrls => "signed_url_cache.v1",
    }
  }

  /// How long a snapshot stays usable. `None` never expires.
  pub fn ttl(self) -> Option<Duration> {
    match self {
      Self::Profile => Some(Duration::minutes(15)),
      Self::GridPreview | Self::GridItems | Self::BacklogItems => Some(Duration::minutes(3)),
      // Hydration always shows the last feed, however old.
      Self::FeedEntries => None,
      Self::SignedUrls => None,
    }
  }
}

/// Snapshot cache shared by the loaders.
#[derive(Clone)]
pub struct SnapshotCache {
  store: Arc<dyn SnapshotStore>,
}

impl SnapshotCache {
  pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
    Self { store }
  }

  /// Read a snapshot. Storage and decode failures are logged and read as a
  /// miss.
  pub fn get<T: DeserializeOwned>(&self, namespace: Namespace, owner_id: &str) -> Option<T> {
    let stored = match self.store.read(namespace.as_str(), owner_id) {
      Ok(Some(stored)) => stored,
      Ok(None) => return None,
      Err(e) => {
        warn!(namespace = namespace.as_str(), owner_id, error = %e, "snapshot read failed");
        return None;
      }
    };

    if let Some(ttl) = namespace.ttl() {
      if Utc::now() - stored.stored_at > ttl {
        debug!(namespace = namespace.as_str(), owner_id, "snapshot expired");
        if let Err(e) = self.store.remove(namespace.as_str(), owner_id) {
          warn!(namespace = namespace.as_str(), owner_id, error = %e, "dropping expired snapshot failed");
        }
        return None;
      }
    }

    match serde_json::from_slice(&stored.data) {
      Ok(value) => {
        debug!(namespace = namespace.as_str(), owner_id, "snapshot hit");
        Some(value)
      }
      Err(e) => {
        warn!(namespace = namespace.as_str(), owner_id, error = %e, "snapshot decode failed");
        None
      }
    }
  }

  pub fn set<T: Serialize>(
    &self,
    namespace: Namespace,
    owner_id: &str,
    value: &T,
  ) -> Result<(), LoadError> {
    let data = serde_json::to_vec(value).map_err(|e| LoadError::CacheWrite(e.to_string()))?;
    self
      .store
      .write(namespace.as_str(), owner_id, &data)
      .map_err(|e| LoadError::CacheWrite(e.to_string()))?;
    debug!(namespace = namespace.as_str(), owner_id, bytes = data.len(), "snapshot stored");
    Ok(())
  }

  /// Like [`set`](Self::set) but logs and swallows the failure.
  pub fn persist<T: Serialize>(&self, namespace: Namespace, owner_id: &str, value: &T) {
    if let Err(e) = self.set(namespace, owner_id, value) {
      warn!(namespace = namespace.as_str(), owner_id, error = %e, "snapshot write failed");
    }
  }

  pub fn remove(&self, namespace: Namespace, owner_id: &str) -> Result<(), LoadError> {
    self
      .store
      .remove(namespace.as_str(), owner_id)
      .map_err(|e| LoadError::CacheWrite(e.to_string()))
  }

  /// Drop every namespace for one user.
  pub fn clear_owner(&self, owner_id: &str) -> Result<(), LoadError> {
    self
      .store
      .clear_owner(owner_id)
      .map_err(|e| LoadError::CacheWrite(e.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{MemorySnapshotStore, StoredSnapshot};
  use color_eyre::{eyre::eyre, Result};

  struct FailingStore;

  impl SnapshotStore for FailingStore {
    fn read(&self, _: &str, _: &str) -> Result<Option<StoredSnapshot>> {
      Err(eyre!("disk unplugged"))
    }
    fn write(&self, _: &str, _: &str, _: &[u8]) -> Result<()> {
      Err(eyre!("disk unplugged"))
    }
    fn remove(&self, _: &str, _: &str) -> Result<()> {
      Err(eyre!("disk unplugged"))
    }
    fn clear_owner(&self, _: &str) -> Result<()> {
      Err(eyre!("disk unplugged"))
    }
  }

  #[test]
  fn test_typed_round_trip() {
    let cache = SnapshotCache::new(Arc::new(MemorySnapshotStore::new()));
    cache
      .set(Namespace::BacklogItems, "u1", &vec!["a".to_string(), "b".to_string()])
      .unwrap();
    let items: Option<Vec<String>> = cache.get(Namespace::BacklogItems, "u1");
    assert_eq!(items, Some(vec!["a".to_string(), "b".to_string()]));
  }

  #[test]
  fn test_expired_snapshot_reads_as_miss_and_is_removed() {
    let store = Arc::new(MemorySnapshotStore::new());
    let old = Utc::now() - Duration::minutes(20);
    store.write_at("profile", "u1", b"\"alice\"", old).unwrap();

    let cache = SnapshotCache::new(store.clone());
    let profile: Option<String> = cache.get(Namespace::Profile, "u1");
    assert_eq!(profile, None);
    assert!(store.is_empty());
  }

  #[test]
  fn test_feed_snapshot_never_expires() {
    let store = Arc::new(MemorySnapshotStore::new());
    let old = Utc::now() - Duration::days(30);
    store.write_at("feed_entries", "u1", b"[1,2]", old).unwrap();

    let cache = SnapshotCache::new(store);
    let entries: Option<Vec<u32>> = cache.get(Namespace::FeedEntries, "u1");
    assert_eq!(entries, Some(vec![1, 2]));
  }

  #[test]
  fn test_storage_failures_degrade() {
    let cache = SnapshotCache::new(Arc::new(FailingStore));
    let read: Option<String> = cache.get(Namespace::Profile, "u1");
    assert_eq!(read, None);

    let err = cache.set(Namespace::Profile, "u1", &"x").unwrap_err();
    assert!(matches!(err, LoadError::CacheWrite(_)));

    // persist swallows the failure
    cache.persist(Namespace::Profile, "u1", &"x");
  }

  #[test]
  fn test_undecodable_snapshot_is_a_miss() {
    let store = Arc::new(MemorySnapshotStore::new());
    store.write("feed_entries", "u1", b"not json").unwrap();
    let cache = SnapshotCache::new(store);
    let entries: Option<Vec<u32>> = cache.get(Namespace::FeedEntries, "u1");
    assert_eq!(entries, None);
  }
}
