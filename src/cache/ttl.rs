//! Capacity- and time-bounded key/value cache with recency eviction.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
  value: V,
  expires_at: Instant,
  recency_rank: u64,
}

#[derive(Debug)]
struct Inner<K, V> {
  entries: HashMap<K, CacheEntry<V>>,
  /// recency_rank -> key, oldest first
  order: BTreeMap<u64, K>,
  next_rank: u64,
}

/// LRU cache whose entries also expire after a TTL.
///
/// A lookup never returns an entry past its expiry, and the cache never holds
/// more than `capacity` entries. Eviction is all-or-nothing: an evicted key
/// must be fetched again.
#[derive(Debug)]
pub struct BoundedTtlCache<K, V> {
  capacity: usize,
  ttl: Duration,
  inner: Mutex<Inner<K, V>>,
}

impl<K, V> BoundedTtlCache<K, V>
where
  K: Eq + Hash + Clone,
  V: Clone,
{
  pub fn new(capacity: usize, ttl: Duration) -> Self {
    Self {
      capacity,
      ttl,
      inner: Mutex::new(Inner {
        entries: HashMap::new(),
        order: BTreeMap::new(),
        next_rank: 0,
      }),
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  /// Get a live value, promoting it to most recently used.
  pub fn get(&self, key: &K) -> Option<V> {
    let mut inner = self.lock();
    let now = Instant::now();

    let (expired, old_rank) = match inner.entries.get(key) {
      Some(entry) => (now > entry.expires_at, entry.recency_rank),
      None => return None,
    };

    inner.order.remove(&old_rank);
    if expired {
      inner.entries.remove(key);
      return None;
    }

    let rank = inner.bump();
    inner.order.insert(rank, key.clone());
    let entry = inner.entries.get_mut(key)?;
    entry.recency_rank = rank;
    Some(entry.value.clone())
  }

  /// Insert or overwrite with the cache-wide TTL.
  pub fn set(&self, key: K, value: V) {
    self.set_with_ttl(key, value, self.ttl);
  }

  /// Insert with a TTL capped at the cache-wide TTL.
  pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
    if self.capacity == 0 {
      return;
    }

    let ttl = ttl.min(self.ttl);
    let mut inner = self.lock();

    if let Some(old) = inner.entries.get(&key) {
      let old_rank = old.recency_rank;
      inner.order.remove(&old_rank);
    }

    let rank = inner.bump();
    inner.order.insert(rank, key.clone());
    inner.entries.insert(
      key,
      CacheEntry {
        value,
        expires_at: Instant::now() + ttl,
        recency_rank: rank,
      },
    );

    while inner.entries.len() > self.capacity {
      let Some((_, oldest)) = inner.order.pop_first() else {
        break;
      };
      inner.entries.remove(&oldest);
    }
  }

  pub fn remove(&self, key: &K) -> Option<V> {
    let mut inner = self.lock();
    let entry = inner.entries.remove(key)?;
    inner.order.remove(&entry.recency_rank);
    Some(entry.value)
  }

  pub fn clear(&self) {
    let mut inner = self.lock();
    inner.entries.clear();
    inner.order.clear();
  }

  /// Number of stored entries, expired ones included until touched.
  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
    self
      .inner
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner)
  }
}

impl<K, V> Inner<K, V> {
  fn bump(&mut self) -> u64 {
    let rank = self.next_rank;
    self.next_rank += 1;
    rank
  }
}
