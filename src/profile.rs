//! Profile bundles: a user's profile with their grid and backlog, loaded once
//! and shared by every screen that shows them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::backend::{ItemFilter, ItemQuery, ItemRecord, ProfileRecord, RecordSource};
use crate::cache::{Namespace, RequestMemoizer, SnapshotCache};
use crate::error::LoadError;

/// Grid items shown on a profile before the full grid loads.
pub const GRID_PREVIEW_SIZE: u32 = 12;
pub const BACKLOG_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSnapshot {
  pub profile: ProfileRecord,
  pub grid_items: Vec<ItemRecord>,
  pub backlog_items: Vec<ItemRecord>,
  pub timestamp: DateTime<Utc>,
}

pub type Bundle = Arc<ProfileSnapshot>;

struct Inner {
  records: Arc<dyn RecordSource>,
  snapshots: SnapshotCache,
  bundles: Mutex<HashMap<String, Bundle>>,
  pending: RequestMemoizer<String, Result<Bundle, LoadError>>,
}

/// Loads [`ProfileSnapshot`]s by user name. Clones share state.
#[derive(Clone)]
pub struct ProfileBundleLoader {
  inner: Arc<Inner>,
}

impl ProfileBundleLoader {
  pub fn new(records: Arc<dyn RecordSource>, snapshots: SnapshotCache) -> Self {
    Self {
      inner: Arc::new(Inner {
        records,
        snapshots,
        bundles: Mutex::new(HashMap::new()),
        pending: RequestMemoizer::new(),
      }),
    }
  }

  fn bundles(&self) -> MutexGuard<'_, HashMap<String, Bundle>> {
    self
      .inner
      .bundles
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// The bundle already in memory, if any.
  pub fn cached(&self, user_name: &str) -> Option<Bundle> {
    self.bundles().get(user_name).cloned()
  }

  pub fn is_loading(&self, user_name: &str) -> bool {
    self.inner.pending.is_pending(&user_name.to_string())
  }

  /// The bundle for `user_name`: from memory, by joining a running load, or
  /// by loading it.
  pub async fn get_bundle(&self, user_name: &str) -> Result<Bundle, LoadError> {
    if let Some(bundle) = self.cached(user_name) {
      debug!(user_name, "profile bundle cache hit");
      return Ok(bundle);
    }

    let this = self.clone();
    let owned = user_name.to_string();
    self
      .inner
      .pending
      .acquire(owned.clone(), move || async move { this.load(&owned).await })
      .await
  }

  /// Warm the bundle in the background. Errors are logged and dropped.
  pub fn prime_bundle(&self, user_name: &str) {
    if self.cached(user_name).is_some() || self.is_loading(user_name) {
      return;
    }
    let this = self.clone();
    let user_name = user_name.to_string();
    tokio::spawn(async move {
      if let Err(err) = this.get_bundle(&user_name).await {
        debug!(user_name = %user_name, error = %err, "profile prime failed");
      }
    });
  }

  /// Load again from the network, replacing the bundle wholesale.
  pub async fn refresh_bundle(&self, user_name: &str) -> Result<Bundle, LoadError> {
    self.clear_bundle(Some(user_name));
    self.get_bundle(user_name).await
  }

  /// Evict one user's bundle, or every bundle.
  pub fn clear_bundle(&self, user_name: Option<&str>) {
    match user_name {
      Some(user_name) => {
        self.bundles().remove(user_name);
        self.inner.pending.forget(&user_name.to_string());
      }
      None => {
        self.bundles().clear();
        self.inner.pending.clear();
      }
    }
  }

  /// Build a bundle from persisted snapshots alone. `None` when neither the
  /// profile nor a grid preview is on disk.
  pub fn preload_from_cache(&self, user_name: &str, user_id: &str) -> Option<Bundle> {
    if let Some(bundle) = self.cached(user_name) {
      return Some(bundle);
    }

    let snapshots = &self.inner.snapshots;
    let profile: Option<ProfileRecord> = snapshots.get(Namespace::Profile, user_id);
    let grid: Option<Vec<ItemRecord>> = snapshots.get(Namespace::GridPreview, user_id);
    let backlog: Option<Vec<ItemRecord>> = snapshots.get(Namespace::BacklogItems, user_id);

    let has_grid = grid.as_ref().is_some_and(|items| !items.is_empty());
    if profile.is_none() && !has_grid {
      return None;
    }

    let bundle = Arc::new(ProfileSnapshot {
      profile: profile.unwrap_or_else(|| placeholder_profile(user_id, user_name)),
      grid_items: grid.unwrap_or_default(),
      backlog_items: backlog.unwrap_or_default(),
      timestamp: Utc::now(),
    });
    self
      .bundles()
      .insert(user_name.to_string(), Arc::clone(&bundle));
    Some(bundle)
  }

  /// Fetch the backlog and fold it into the bundle. The bundle is replaced
  /// only when the backlog's item ids changed.
  pub async fn refresh_backlog(&self, user_name: &str) -> Result<Bundle, LoadError> {
    let bundle = self.get_bundle(user_name).await?;
    let query = ItemQuery::new(
      ItemFilter::Backlog {
        creator_id: bundle.profile.id.clone(),
      },
      BACKLOG_PAGE_SIZE,
    );
    let page = self
      .inner
      .records
      .list_items(&query)
      .await
      .map_err(LoadError::network)?;

    let next = page.items;
    if next.is_empty() || same_ids(&bundle.backlog_items, &next) {
      return Ok(bundle);
    }

    self.persist_in_background(Namespace::BacklogItems, &bundle.profile.id, &next);
    let mut bundles = self.bundles();
    let current = bundles
      .get(user_name)
      .cloned()
      .unwrap_or_else(|| Arc::clone(&bundle));
    let updated = Arc::new(ProfileSnapshot {
      backlog_items: next,
      timestamp: Utc::now(),
      ..(*current).clone()
    });
    bundles.insert(user_name.to_string(), Arc::clone(&updated));
    Ok(updated)
  }

  async fn load(&self, user_name: &str) -> Result<Bundle, LoadError> {
    let profile = self
      .inner
      .records
      .profile_by_user_name(user_name)
      .await
      .map_err(LoadError::network)?;
    let user_id = profile.id.clone();

    let preview: Option<Vec<ItemRecord>> = self
      .inner
      .snapshots
      .get(Namespace::GridPreview, &user_id);
    let grid_items = match preview {
      Some(items) if !items.is_empty() => {
        debug!(user_name, "grid preview hit");
        items
      }
      _ => {
        let query = ItemQuery::new(
          ItemFilter::Grid {
            creator_id: user_id.clone(),
          },
          GRID_PREVIEW_SIZE,
        );
        let items = self
          .inner
          .records
          .list_items(&query)
          .await
          .map_err(LoadError::network)?
          .items;
        self.persist_in_background(Namespace::GridItems, &user_id, &items);
        self.persist_in_background(Namespace::GridPreview, &user_id, &items);
        items
      }
    };

    // Rewritten on every load so the profile snapshot stays fresh.
    self.persist_in_background(Namespace::Profile, &user_id, &profile);

    let bundle = Arc::new(ProfileSnapshot {
      profile,
      grid_items,
      backlog_items: Vec::new(),
      timestamp: Utc::now(),
    });
    self
      .bundles()
      .insert(user_name.to_string(), Arc::clone(&bundle));
    info!(user_name, grid = bundle.grid_items.len(), "profile bundle loaded");
    Ok(bundle)
  }

  fn persist_in_background<T>(&self, namespace: Namespace, owner_id: &str, value: &T)
  where
    T: Serialize + Clone + Send + 'static,
  {
    let snapshots = self.inner.snapshots.clone();
    let owner_id = owner_id.to_string();
    let value = value.clone();
    let task = tokio::task::spawn_blocking(move || {
      snapshots.persist(namespace, &owner_id, &value);
    });
    drop(task);
  }
}

fn same_ids(current: &[ItemRecord], next: &[ItemRecord]) -> bool {
  current.len() == next.len() && current.iter().zip(next).all(|(a, b)| a.id == b.id)
}

fn placeholder_profile(user_id: &str, user_name: &str) -> ProfileRecord {
  warn!(user_name, "profile snapshot missing, using placeholder");
  ProfileRecord {
    id: user_id.to_string(),
    user_name: user_name.to_string(),
    first_name: None,
    last_name: None,
    name: None,
    image: None,
    avatar_url: None,
  }
}
