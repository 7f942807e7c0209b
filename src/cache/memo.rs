//! Single-flight de-duplication of concurrent fetches sharing a key.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

type SharedFut<V> = Shared<BoxFuture<'static, V>>;

struct Pending<K, V> {
  requests: HashMap<K, (u64, SharedFut<V>)>,
  next_id: u64,
}

/// At most one in-flight request per key; concurrent callers share the result.
///
/// The in-flight entry is removed by the shared future itself once it
/// settles, on success and on failure alike.
pub struct RequestMemoizer<K, V> {
  pending: Arc<Mutex<Pending<K, V>>>,
}

impl<K, V> RequestMemoizer<K, V>
where
  K: Eq + Hash + Clone + Send + 'static,
  V: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self {
      pending: Arc::new(Mutex::new(Pending {
        requests: HashMap::new(),
        next_id: 0,
      })),
    }
  }

  /// Join the pending request for `key`, or start one with `factory`.
  ///
  /// `factory` is only invoked when nothing is pending for `key`. The work
  /// runs inside the callers' futures: if they are all dropped it pauses
  /// until the next caller for `key` picks it up.
  pub async fn acquire<F, Fut>(&self, key: K, factory: F) -> V
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = V> + Send + 'static,
  {
    let shared = self.join_or_start(key, factory, |work| work);
    shared.await
  }

  /// Like [`acquire`](Self::acquire), but the work runs on its own task, so
  /// it finishes and leaves the map even when every caller is dropped.
  /// Resources it holds (gate slots, connections) are always released.
  ///
  /// `lost` stands in for the result if the task panics or is cancelled.
  pub async fn acquire_detached<F, Fut, L>(&self, key: K, factory: F, lost: L) -> V
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = V> + Send + 'static,
    L: FnOnce() -> V + Send + 'static,
  {
    let shared = self.join_or_start(key, factory, |work| {
      let task = tokio::spawn(work);
      async move {
        match task.await {
          Ok(out) => out,
          Err(err) => {
            warn!(error = %err, "detached request did not complete");
            lost()
          }
        }
      }
      .boxed()
    });
    shared.await
  }

  fn join_or_start<F, Fut, S>(&self, key: K, factory: F, start: S) -> SharedFut<V>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = V> + Send + 'static,
    S: FnOnce(BoxFuture<'static, V>) -> BoxFuture<'static, V>,
  {
    let mut pending = lock(&self.pending);
    if let Some((_, existing)) = pending.requests.get(&key) {
      return existing.clone();
    }

    let fut = factory();
    let id = pending.next_id;
    pending.next_id += 1;
    let settle = Settle {
      map: Arc::clone(&self.pending),
      key: key.clone(),
      id,
    };
    let work = async move {
      let _settle = settle;
      fut.await
    }
    .boxed();

    let shared = start(work).shared();
    pending.requests.insert(key, (id, shared.clone()));
    shared
  }

  /// Whether a request for `key` is currently pending.
  pub fn is_pending(&self, key: &K) -> bool {
    lock(&self.pending).requests.contains_key(key)
  }

  /// Number of keys with a pending request.
  pub fn in_flight(&self) -> usize {
    lock(&self.pending).requests.len()
  }

  /// Forget the pending request for `key`; the next caller starts afresh.
  pub fn forget(&self, key: &K) {
    let removed = lock(&self.pending).requests.remove(key);
    drop(removed);
  }

  /// Forget every pending request. Callers already awaiting keep their
  /// handle and still receive the result.
  pub fn clear(&self) {
    let drained: Vec<_> = lock(&self.pending).requests.drain().collect();
    drop(drained);
  }
}

/// Removes its request's entry once the work completes, panics or is torn
/// down. Only its own entry: the key may have been forgotten and reused.
struct Settle<K: Eq + Hash, V> {
  map: Arc<Mutex<Pending<K, V>>>,
  key: K,
  id: u64,
}

impl<K: Eq + Hash, V> Drop for Settle<K, V> {
  fn drop(&mut self) {
    let settled = {
      let mut pending = lock(&self.map);
      match pending.requests.get(&self.key) {
        Some((current, _)) if *current == self.id => pending.requests.remove(&self.key),
        _ => None,
      }
    };
    drop(settled);
  }
}

impl<K, V> Default for RequestMemoizer<K, V>
where
  K: Eq + Hash + Clone + Send + 'static,
  V: Clone + Send + Sync + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<K, V> Clone for RequestMemoizer<K, V> {
  fn clone(&self) -> Self {
    Self {
      pending: Arc::clone(&self.pending),
    }
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex
    .lock()
    .unwrap_or_else(std::sync::PoisonError::into_inner)
}
