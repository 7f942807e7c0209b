//! Signed image URL resolution.
//!
//! Lookup order for a gateway image: the TTL cache, then a single-flight
//! signing request gated to a few concurrent calls. The signing service
//! sometimes hands the unsigned URL back; that counts as a failed attempt and
//! is retried with linear backoff. When retries run out the key is marked
//! exhausted and callers get the last URL that worked for the same content.
//!
//! With a snapshot cache attached, signed URLs outlive the process: they are
//! written back after every successful signing and reloaded on construction,
//! minus the ones that expired in between.

use chrono::Utc;
use futures::future::{AbortHandle, AbortRegistration, Abortable, Aborted};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use super::gateway::{content_id, sized_url, Dimensions};
use crate::backend::{SignedUrl, UrlSigner};
use crate::cache::{
  BackoffPolicy, BoundedTtlCache, ConcurrencyGate, Namespace, RequestMemoizer, SnapshotCache,
};
use crate::config::ImagesConfig;
use crate::error::LoadError;

/// Signed URLs are not tied to a user.
const SIGNED_URL_OWNER: &str = "device";

/// One signed URL as stored in the snapshot cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedUrl {
  key: String,
  cid: String,
  signed_url: String,
  /// Validity in seconds, counted from `date`
  expires: u64,
  /// Signing time, epoch milliseconds
  date: i64,
}

impl PersistedUrl {
  /// Time this URL may still be served, capped at `max_ttl` from signing.
  fn remaining(&self, max_ttl: Duration, now_ms: i64) -> Option<Duration> {
    let lifetime = Duration::from_secs(self.expires).min(max_ttl);
    let age = Duration::from_millis(u64::try_from(now_ms - self.date).unwrap_or(0));
    lifetime.checked_sub(age).filter(|left| !left.is_zero())
  }
}

#[derive(Default)]
struct ResolverState {
  /// content id -> last signed URL that worked, at any size
  last_good: HashMap<String, String>,
  /// Keys whose automatic retries ran out
  exhausted: HashSet<String>,
  /// content id -> key and abort handle of its running request
  in_flight: HashMap<String, (String, AbortHandle)>,
  /// key -> entry mirrored to the snapshot cache
  persisted: HashMap<String, PersistedUrl>,
}

struct Inner {
  signer: Arc<dyn UrlSigner>,
  cache: BoundedTtlCache<String, String>,
  pending: RequestMemoizer<String, Result<String, LoadError>>,
  gate: ConcurrencyGate,
  backoff: BackoffPolicy,
  gateway_host: String,
  min_dimension: u32,
  state: Mutex<ResolverState>,
  snapshots: Option<SnapshotCache>,
  /// Held while the persisted snapshot is written or removed
  persist_lock: Mutex<()>,
}

/// Turns gateway image URLs into signed ones. Clones share caches.
#[derive(Clone)]
pub struct SignedUrlResolver {
  inner: Arc<Inner>,
}

impl SignedUrlResolver {
  /// Resolver with an in-memory cache only.
  pub fn new(signer: Arc<dyn UrlSigner>, config: &ImagesConfig) -> Self {
    Self::build(signer, config, None)
  }

  /// Resolver whose signed URLs are persisted to `snapshots`. Unexpired
  /// entries from an earlier run are loaded straight away.
  pub fn with_snapshots(
    signer: Arc<dyn UrlSigner>,
    config: &ImagesConfig,
    snapshots: SnapshotCache,
  ) -> Self {
    let resolver = Self::build(signer, config, Some(snapshots));
    resolver.restore();
    resolver
  }

  fn build(
    signer: Arc<dyn UrlSigner>,
    config: &ImagesConfig,
    snapshots: Option<SnapshotCache>,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        signer,
        cache: BoundedTtlCache::new(config.cache_capacity, config.cache_ttl()),
        pending: RequestMemoizer::new(),
        gate: ConcurrencyGate::new(config.max_concurrent).with_max_waiters(config.max_pending),
        backoff: config.backoff(),
        gateway_host: config.gateway_host.clone(),
        min_dimension: config.min_dimension,
        state: Mutex::new(ResolverState::default()),
        snapshots,
        persist_lock: Mutex::new(()),
      }),
    }
  }

  fn state(&self) -> MutexGuard<'_, ResolverState> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Content id and signing key, or `None` when `source` is served as-is.
  fn target(&self, source: &str, dims: Dimensions) -> Option<(String, String)> {
    if !dims.needs_signing(self.inner.min_dimension) {
      return None;
    }
    let cid = content_id(source)?;
    Some((cid.to_string(), sized_url(&self.inner.gateway_host, cid, dims)))
  }

  fn fallback(&self, cid: &str, source: &str) -> String {
    self
      .state()
      .last_good
      .get(cid)
      .cloned()
      .unwrap_or_else(|| source.to_string())
  }

  /// URL to display for `source` at `dims`, signing it if needed.
  ///
  /// Never fails: anything that goes wrong yields the last known-good URL
  /// for the same content, else `source` itself.
  pub async fn resolve(&self, source: &str, dims: Dimensions) -> String {
    let Some((cid, key)) = self.target(source, dims) else {
      return source.to_string();
    };

    if let Some(signed) = self.inner.cache.get(&key) {
      return signed;
    }
    let exhausted = self.state().exhausted.contains(&key);
    if exhausted {
      return self.fallback(&cid, source);
    }

    let this = self.clone();
    let result = self
      .inner
      .pending
      .acquire_detached(
        key.clone(),
        {
          let cid = cid.clone();
          let key = key.clone();
          move || async move { this.sign_with_retry(&cid, &key).await }
        },
        || Err(LoadError::Cancelled),
      )
      .await;

    match result {
      Ok(signed) => signed,
      Err(err) => {
        debug!(error = %err, key = %key, "using fallback image url");
        self.fallback(&cid, source)
      }
    }
  }

  /// What to show right now without waiting: the cached signed URL, else
  /// the last known-good one, else `source`.
  pub fn peek(&self, source: &str, dims: Dimensions) -> String {
    let Some((cid, key)) = self.target(source, dims) else {
      return source.to_string();
    };
    self
      .inner
      .cache
      .get(&key)
      .unwrap_or_else(|| self.fallback(&cid, source))
  }

  /// Automatic retries ran out; the caller may offer a manual retry.
  pub fn is_exhausted(&self, source: &str, dims: Dimensions) -> bool {
    self
      .target(source, dims)
      .is_some_and(|(_, key)| self.state().exhausted.contains(&key))
  }

  /// Clear the exhausted mark and resolve again.
  pub async fn retry(&self, source: &str, dims: Dimensions) -> String {
    if let Some((_, key)) = self.target(source, dims) {
      self.state().exhausted.remove(&key);
    }
    self.resolve(source, dims).await
  }

  /// Forget every cached URL, persisted ones included, and abort running
  /// requests.
  pub fn clear(&self) {
    let _writing = self
      .inner
      .persist_lock
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    self.inner.cache.clear();
    self.inner.pending.clear();
    {
      let mut state = self.state();
      for (_, (_, handle)) in state.in_flight.drain() {
        handle.abort();
      }
      state.last_good.clear();
      state.exhausted.clear();
      state.persisted.clear();
    }
    if let Some(snapshots) = &self.inner.snapshots {
      if let Err(err) = snapshots.remove(Namespace::SignedUrls, SIGNED_URL_OWNER) {
        warn!(error = %err, "dropping persisted signed urls failed");
      }
    }
  }

  fn restore(&self) {
    let Some(snapshots) = &self.inner.snapshots else {
      return;
    };
    let mut stored: Vec<PersistedUrl> = snapshots
      .get(Namespace::SignedUrls, SIGNED_URL_OWNER)
      .unwrap_or_default();
    // Oldest first: the newest signing per content wins `last_good`.
    stored.sort_by_key(|entry| entry.date);

    let now = Utc::now().timestamp_millis();
    let total = stored.len();
    let mut state = self.state();
    for entry in stored {
      let Some(left) = entry.remaining(self.inner.cache.ttl(), now) else {
        continue;
      };
      self
        .inner
        .cache
        .set_with_ttl(entry.key.clone(), entry.signed_url.clone(), left);
      state
        .last_good
        .insert(entry.cid.clone(), entry.signed_url.clone());
      state.persisted.insert(entry.key.clone(), entry);
    }
    let restored = state.persisted.len();
    debug!(restored, expired = total - restored, "loaded persisted signed urls");
  }

  /// Mirror a fresh signing into the snapshot cache, off the async threads.
  fn remember(&self, cid: &str, key: &str, signed: &SignedUrl) {
    if self.inner.snapshots.is_none() {
      return;
    }
    {
      let now = Utc::now().timestamp_millis();
      let max_ttl = self.inner.cache.ttl();
      let mut state = self.state();
      state.persisted.insert(
        key.to_string(),
        PersistedUrl {
          key: key.to_string(),
          cid: cid.to_string(),
          signed_url: signed.signed_url.clone(),
          expires: signed.expires,
          date: signed.date,
        },
      );
      state
        .persisted
        .retain(|_, entry| entry.remaining(max_ttl, now).is_some());

      let capacity = self.inner.cache.capacity();
      if state.persisted.len() > capacity {
        let mut by_age: Vec<(i64, String)> = state
          .persisted
          .values()
          .map(|entry| (entry.date, entry.key.clone()))
          .collect();
        by_age.sort();
        let excess = by_age.len() - capacity;
        for (_, old) in by_age.into_iter().take(excess) {
          state.persisted.remove(&old);
        }
      }
    }

    let this = self.clone();
    let task = tokio::task::spawn_blocking(move || this.write_persisted());
    drop(task);
  }

  fn write_persisted(&self) {
    let Some(snapshots) = &self.inner.snapshots else {
      return;
    };
    let _writing = self
      .inner
      .persist_lock
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    let mut entries: Vec<PersistedUrl> = self.state().persisted.values().cloned().collect();
    if entries.is_empty() {
      if let Err(err) = snapshots.remove(Namespace::SignedUrls, SIGNED_URL_OWNER) {
        warn!(error = %err, "dropping persisted signed urls failed");
      }
      return;
    }
    entries.sort_by_key(|entry| entry.date);
    snapshots.persist(Namespace::SignedUrls, SIGNED_URL_OWNER, &entries);
  }

  /// Register a cancellable step for `cid`. A running request for the same
  /// content at another size is stale and gets aborted.
  fn register(&self, cid: &str, key: &str) -> AbortRegistration {
    let (handle, registration) = AbortHandle::new_pair();
    let previous = self
      .state()
      .in_flight
      .insert(cid.to_string(), (key.to_string(), handle));
    if let Some((previous_key, previous)) = previous {
      if previous_key != key {
        debug!(stale = %previous_key, key, "aborting superseded signing request");
        previous.abort();
      }
    }
    registration
  }

  fn unregister(&self, cid: &str, key: &str) {
    let mut state = self.state();
    if state.in_flight.get(cid).is_some_and(|(k, _)| k == key) {
      state.in_flight.remove(cid);
    }
  }

  async fn sign_once(&self, cid: &str, key: &str) -> Result<SignedUrl, LoadError> {
    let registration = self.register(cid, key);
    let call = Abortable::new(self.inner.signer.sign_url(key), registration);
    match self.inner.gate.run(call).await? {
      Err(Aborted) => Err(LoadError::Cancelled),
      Ok(Err(err)) => Err(LoadError::network(err)),
      Ok(Ok(signed)) if signed.signed_url == key => Err(LoadError::SignatureTransient),
      Ok(Ok(signed)) => Ok(signed),
    }
  }

  async fn sign_with_retry(&self, cid: &str, key: &str) -> Result<String, LoadError> {
    let mut retry = 0;
    let outcome = loop {
      match self.sign_once(cid, key).await {
        Ok(signed) => break Ok(signed),
        Err(err @ (LoadError::Cancelled | LoadError::QueueFull)) => break Err(err),
        Err(err) => {
          retry += 1;
          if retry > self.inner.backoff.max_retries {
            warn!(key, error = %err, "giving up on signed url");
            break Err(LoadError::SignatureFatal { attempts: retry });
          }
          debug!(key, retry, error = %err, "signing failed, retrying");
          let registration = self.register(cid, key);
          if let Err(err) = self.inner.backoff.sleep(retry, registration).await {
            break Err(err);
          }
        }
      }
    };
    self.unregister(cid, key);

    match outcome {
      Ok(signed) => {
        let ttl = Duration::from_secs(signed.expires).min(self.inner.cache.ttl());
        self
          .inner
          .cache
          .set_with_ttl(key.to_string(), signed.signed_url.clone(), ttl);
        {
          let mut state = self.state();
          state.exhausted.remove(key);
          state
            .last_good
            .insert(cid.to_string(), signed.signed_url.clone());
        }
        self.remember(cid, key, &signed);
        Ok(signed.signed_url)
      }
      Err(err) => {
        if let LoadError::SignatureFatal { .. } = err {
          self.state().exhausted.insert(key.to_string());
        }
        Err(err)
      }
    }
  }
}
