//! One place that builds every cache, gate and loader for the application and
//! hands out the shared instances.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::{
  GatewaySigner, InterestClient, InterestSource, RecordSource, RecordStoreClient, UrlSigner,
};
use crate::cache::{NoopSnapshotStore, SnapshotCache, SnapshotStore, SqliteSnapshotStore};
use crate::config::Config;
use crate::feed::FeedPager;
use crate::images::SignedUrlResolver;
use crate::profile::ProfileBundleLoader;
use crate::session::Session;

pub struct AppContext {
  pub config: Config,
  pub session: Session,
  pub snapshots: SnapshotCache,
  pub feed: FeedPager,
  pub profiles: ProfileBundleLoader,
  /// Absent when no signing token is configured
  pub images: Option<SignedUrlResolver>,
}

impl AppContext {
  /// Build the HTTP clients and snapshot store described by `config`.
  pub fn from_config(config: Config, session: Session) -> Result<Self> {
    let records: Arc<dyn RecordSource> = Arc::new(RecordStoreClient::new(&config.backend)?);

    let interests: Option<Arc<dyn InterestSource>> =
      match (&config.interests, config.feed.include_interest_joins) {
        (Some(interests), true) => Some(Arc::new(InterestClient::new(interests)?)),
        (None, true) => {
          warn!("interest joins enabled but no interests source configured");
          None
        }
        _ => None,
      };

    let signer: Option<Arc<dyn UrlSigner>> = match GatewaySigner::new(&config.images) {
      Ok(signer) => Some(Arc::new(signer)),
      Err(e) => {
        warn!("Image signing disabled: {}", e);
        None
      }
    };

    let store: Arc<dyn SnapshotStore> = if config.cache.enabled {
      Arc::new(SqliteSnapshotStore::open(config.cache.path.as_deref())?)
    } else {
      info!("snapshot cache disabled");
      Arc::new(NoopSnapshotStore)
    };

    Ok(Self::with_sources(
      config, session, records, interests, signer, store,
    ))
  }

  /// Assemble the loaders over the given collaborators.
  pub fn with_sources(
    config: Config,
    session: Session,
    records: Arc<dyn RecordSource>,
    interests: Option<Arc<dyn InterestSource>>,
    signer: Option<Arc<dyn UrlSigner>>,
    store: Arc<dyn SnapshotStore>,
  ) -> Self {
    let snapshots = SnapshotCache::new(store);
    let feed = FeedPager::new(
      Arc::clone(&records),
      interests,
      snapshots.clone(),
      session.clone(),
      &config.feed,
    );
    let profiles = ProfileBundleLoader::new(records, snapshots.clone());
    let images = signer
      .map(|signer| SignedUrlResolver::with_snapshots(signer, &config.images, snapshots.clone()));

    Self {
      config,
      session,
      snapshots,
      feed,
      profiles,
      images,
    }
  }

  /// App-wide cache clear: every in-memory cache plus the signed-in user's
  /// persisted snapshots.
  pub fn clear_all(&self) {
    self.feed.invalidate_cache();
    self.profiles.clear_bundle(None);
    if let Some(images) = &self.images {
      images.clear();
    }
    if let Ok(user_id) = self.session.user_id() {
      if let Err(e) = self.snapshots.clear_owner(&user_id) {
        warn!(error = %e, "failed to clear persisted snapshots");
      }
    }
    info!("caches cleared");
  }
}
