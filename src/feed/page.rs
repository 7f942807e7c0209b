//! Fetching one page of the activity feed.
//!
//! A page merges two sources: feed-eligible items from the record store and,
//! when enabled, interest-join events. Each source fails independently; a
//! failed source contributes nothing, including to `has_more`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use super::entry::{FeedEntry, Projections};
use crate::backend::{
  InterestSource, ItemFilter, ItemQuery, ItemRecord, ProfileRecord, RecordSource, RefRecord,
  SubscriptionRow,
};
use crate::error::LoadError;

/// One page of entries plus where the next one starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
  pub entries: Vec<FeedEntry>,
  /// `created` of the last entry; the next page is strictly older
  pub cursor: Option<DateTime<Utc>>,
  pub has_more: bool,
}

/// What one source contributed to a page.
struct SourceResult {
  entries: Vec<FeedEntry>,
  has_more: bool,
}

/// Fetches feed pages, resolving actors and refs through shared projections.
#[derive(Clone)]
pub struct PageFetcher {
  records: Arc<dyn RecordSource>,
  interests: Option<Arc<dyn InterestSource>>,
  projections: Arc<Mutex<Projections>>,
}

impl PageFetcher {
  pub fn new(records: Arc<dyn RecordSource>, projections: Arc<Mutex<Projections>>) -> Self {
    Self {
      records,
      interests: None,
      projections,
    }
  }

  /// Merge interest-join events into every page.
  pub fn with_interests(mut self, interests: Arc<dyn InterestSource>) -> Self {
    self.interests = Some(interests);
    self
  }

  fn projections(&self) -> MutexGuard<'_, Projections> {
    self
      .projections
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Fetch up to `limit` entries strictly older than `before`.
  ///
  /// Fails only when every consulted source failed; a single failed source
  /// degrades to an empty contribution.
  pub async fn fetch_page(
    &self,
    before: Option<DateTime<Utc>>,
    limit: usize,
  ) -> Result<FeedPage, LoadError> {
    let items = self.fetch_items(before, limit);
    let joins = async {
      match &self.interests {
        Some(interests) => Some(self.fetch_joins(interests.as_ref(), before, limit).await),
        None => None,
      }
    };
    let (items, joins) = futures::join!(items, joins);

    let mut sources = Vec::with_capacity(2);
    let mut failures = Vec::new();
    for result in std::iter::once(items).chain(joins) {
      match result {
        Ok(source) => sources.push(source),
        Err(err) => {
          warn!(error = %err, "feed source degraded to empty");
          failures.push(err);
        }
      }
    }

    if sources.is_empty() {
      let message = failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
      return Err(LoadError::Network(message));
    }

    let page = merge_sources(sources, before, limit);
    debug!(
      entries = page.entries.len(),
      has_more = page.has_more,
      cursor = ?page.cursor,
      "fetched feed page"
    );
    Ok(page)
  }

  async fn fetch_items(
    &self,
    before: Option<DateTime<Utc>>,
    limit: usize,
  ) -> Result<SourceResult, LoadError> {
    // Over-fetch to absorb items dropped during resolution.
    let per_page = u32::try_from(limit.saturating_mul(2)).unwrap_or(u32::MAX);
    let query = ItemQuery::new(ItemFilter::Feed { before }, per_page);
    let page = self
      .records
      .list_items(&query)
      .await
      .map_err(|e| LoadError::PartialSource {
        source_name: "items",
        message: e.to_string(),
      })?;

    let has_more = page.has_more();
    let entries = {
      let mut projections = self.projections();
      page
        .items
        .iter()
        .filter_map(|item| item_entry(&mut projections, item))
        .collect()
    };
    Ok(SourceResult { entries, has_more })
  }

  async fn fetch_joins(
    &self,
    interests: &dyn InterestSource,
    before: Option<DateTime<Utc>>,
    limit: usize,
  ) -> Result<SourceResult, LoadError> {
    // Over-fetch like items; rows whose actor or ref can't be resolved drop out.
    let rows = interests
      .list_subscriptions(before, limit.saturating_mul(2))
      .await
      .map_err(|e| LoadError::PartialSource {
        source_name: "interests",
        message: e.to_string(),
      })?;
    let has_more = rows.len() >= limit;

    let (missing_actors, missing_refs) = {
      let projections = self.projections();
      let actors: HashSet<String> = rows
        .iter()
        .filter(|row| projections.actor(&row.user_id).is_none())
        .map(|row| row.user_id.clone())
        .collect();
      let refs: HashSet<String> = rows
        .iter()
        .filter(|row| projections.ref_summary(&row.ref_id).is_none())
        .map(|row| row.ref_id.clone())
        .collect();
      (
        actors.into_iter().collect::<Vec<_>>(),
        refs.into_iter().collect::<Vec<_>>(),
      )
    };

    let profiles = self.lookup_profiles(&missing_actors).await;
    let refs = self.lookup_refs(&missing_refs).await;

    let entries = {
      let mut projections = self.projections();
      rows
        .iter()
        .filter_map(|row| join_entry(&mut projections, row, &profiles, &refs))
        .collect()
    };
    Ok(SourceResult { entries, has_more })
  }

  async fn lookup_profiles(&self, ids: &[String]) -> HashMap<String, ProfileRecord> {
    if ids.is_empty() {
      return HashMap::new();
    }
    match self.records.profiles_by_ids(ids).await {
      Ok(found) => found.into_iter().map(|p| (p.id.clone(), p)).collect(),
      Err(e) => {
        warn!(error = %e, count = ids.len(), "actor lookup failed");
        HashMap::new()
      }
    }
  }

  async fn lookup_refs(&self, ids: &[String]) -> HashMap<String, RefRecord> {
    if ids.is_empty() {
      return HashMap::new();
    }
    match self.records.refs_by_ids(ids).await {
      Ok(found) => found.into_iter().map(|r| (r.id.clone(), r)).collect(),
      Err(e) => {
        warn!(error = %e, count = ids.len(), "ref lookup failed");
        HashMap::new()
      }
    }
  }
}

fn item_entry(projections: &mut Projections, item: &ItemRecord) -> Option<FeedEntry> {
  let actor = match (&item.expand.creator, item.creator.as_deref()) {
    (Some(record), _) => projections.ensure_actor(record),
    (None, Some(id)) => projections.actor(id)?.clone(),
    (None, None) => return None,
  };
  let ref_summary = match (&item.expand.ref_record, item.ref_id.as_deref()) {
    (Some(record), _) => projections.ensure_ref(record),
    (None, Some(id)) => projections.ref_summary(id)?.clone(),
    (None, None) => return None,
  };

  Some(FeedEntry::RefAdd {
    id: format!("item:{}", item.id),
    created: item.created,
    item_id: item.id.clone(),
    actor,
    ref_summary,
  })
}

fn join_entry(
  projections: &mut Projections,
  row: &SubscriptionRow,
  profiles: &HashMap<String, ProfileRecord>,
  refs: &HashMap<String, RefRecord>,
) -> Option<FeedEntry> {
  let created = row.inserted_at?;
  let actor = match projections.actor(&row.user_id) {
    Some(actor) => actor.clone(),
    None => projections.ensure_actor(profiles.get(&row.user_id)?),
  };
  let ref_summary = match projections.ref_summary(&row.ref_id) {
    Some(summary) => summary.clone(),
    None => projections.ensure_ref(refs.get(&row.ref_id)?),
  };

  Some(FeedEntry::InterestJoin {
    id: format!("interest:{}", row.id),
    created,
    subscription_id: row.id.clone(),
    actor,
    ref_summary,
    community: row.community.clone(),
  })
}

/// Stable newest-first merge, first occurrence of an id wins, truncated to
/// `limit`.
fn merge_sources(
  sources: Vec<SourceResult>,
  before: Option<DateTime<Utc>>,
  limit: usize,
) -> FeedPage {
  let source_has_more = sources.iter().any(|s| s.has_more);
  let mut combined: Vec<FeedEntry> = sources.into_iter().flat_map(|s| s.entries).collect();
  combined.sort_by(|a, b| b.created().cmp(&a.created()));

  let mut seen = HashSet::new();
  combined.retain(|entry| seen.insert(entry.id().to_string()));
  let merged = combined.len();
  combined.truncate(limit);

  let cursor = combined.last().map(FeedEntry::created).or(before);
  FeedPage {
    has_more: source_has_more || merged > combined.len(),
    entries: combined,
    cursor,
  }
}
