//! Seams to the external collaborators. Implementations live next door; tests
//! substitute scripted fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;

use super::query::ItemQuery;
use super::types::{ItemRecord, ListPage, ProfileRecord, RefRecord, SignedUrl, SubscriptionRow};

/// Paged record store holding users, refs and items.
#[async_trait]
pub trait RecordSource: Send + Sync {
  /// Items matching `query`, newest first.
  async fn list_items(&self, query: &ItemQuery) -> Result<ListPage<ItemRecord>>;

  async fn profile_by_user_name(&self, user_name: &str) -> Result<ProfileRecord>;

  async fn profiles_by_ids(&self, ids: &[String]) -> Result<Vec<ProfileRecord>>;

  async fn refs_by_ids(&self, ids: &[String]) -> Result<Vec<RefRecord>>;
}

/// Secondary feed source: interest-join events.
#[async_trait]
pub trait InterestSource: Send + Sync {
  /// Up to `limit` rows strictly older than `before`, newest first.
  async fn list_subscriptions(
    &self,
    before: Option<DateTime<Utc>>,
    limit: usize,
  ) -> Result<Vec<SubscriptionRow>>;
}

/// Image gateway signing service.
///
/// Cancellation is by drop: a superseded request's future is dropped by the
/// caller, which tears down the underlying HTTP request.
#[async_trait]
pub trait UrlSigner: Send + Sync {
  async fn sign_url(&self, url: &str) -> Result<SignedUrl>;
}
