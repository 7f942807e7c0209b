//! Feed entries and the actor/ref projections they carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::backend::{ProfileRecord, RefRecord};

/// Who did something, normalized from a profile record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
  pub id: String,
  pub user_name: String,
  pub display_name: String,
  pub avatar: Option<String>,
  pub image: Option<String>,
}

/// What it was done to, normalized from a ref record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefSummary {
  pub id: String,
  pub title: String,
  pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedEntry {
  /// Someone added a ref to their grid
  #[serde(rename_all = "camelCase")]
  RefAdd {
    id: String,
    created: DateTime<Utc>,
    item_id: String,
    actor: Actor,
    #[serde(rename = "ref")]
    ref_summary: RefSummary,
  },
  /// Someone joined an interest community
  #[serde(rename_all = "camelCase")]
  InterestJoin {
    id: String,
    created: DateTime<Utc>,
    subscription_id: String,
    actor: Actor,
    #[serde(rename = "ref")]
    ref_summary: RefSummary,
    community: Option<String>,
  },
}

impl FeedEntry {
  pub fn id(&self) -> &str {
    match self {
      Self::RefAdd { id, .. } | Self::InterestJoin { id, .. } => id,
    }
  }

  pub fn created(&self) -> DateTime<Utc> {
    match self {
      Self::RefAdd { created, .. } | Self::InterestJoin { created, .. } => *created,
    }
  }

  pub fn actor(&self) -> &Actor {
    match self {
      Self::RefAdd { actor, .. } | Self::InterestJoin { actor, .. } => actor,
    }
  }

  pub fn ref_summary(&self) -> &RefSummary {
    match self {
      Self::RefAdd { ref_summary, .. } | Self::InterestJoin { ref_summary, .. } => ref_summary,
    }
  }
}

fn trimmed(value: Option<&str>) -> Option<&str> {
  value.map(str::trim).filter(|v| !v.is_empty())
}

fn display_name(record: &ProfileRecord) -> String {
  let parts: Vec<&str> = [record.first_name.as_deref(), record.last_name.as_deref()]
    .into_iter()
    .filter_map(trimmed)
    .collect();
  if !parts.is_empty() {
    return parts.join(" ");
  }
  if let Some(name) = trimmed(record.name.as_deref()) {
    return name.to_string();
  }
  if record.user_name.trim().is_empty() {
    "Someone".to_string()
  } else {
    record.user_name.clone()
  }
}

/// Actor and ref projections, built once per id and reused thereafter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Projections {
  actors: HashMap<String, Actor>,
  refs: HashMap<String, RefSummary>,
}

impl Projections {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn actor(&self, id: &str) -> Option<&Actor> {
    self.actors.get(id)
  }

  pub fn ref_summary(&self, id: &str) -> Option<&RefSummary> {
    self.refs.get(id)
  }

  /// Project `record`, or return the cached projection for its id.
  pub fn ensure_actor(&mut self, record: &ProfileRecord) -> Actor {
    self
      .actors
      .entry(record.id.clone())
      .or_insert_with(|| Actor {
        id: record.id.clone(),
        user_name: record.user_name.clone(),
        display_name: display_name(record),
        avatar: trimmed(record.image.as_deref())
          .or_else(|| trimmed(record.avatar_url.as_deref()))
          .map(String::from),
        image: trimmed(record.image.as_deref()).map(String::from),
      })
      .clone()
  }

  pub fn ensure_ref(&mut self, record: &RefRecord) -> RefSummary {
    self
      .refs
      .entry(record.id.clone())
      .or_insert_with(|| RefSummary {
        id: record.id.clone(),
        title: trimmed(record.title.as_deref())
          .unwrap_or("Untitled")
          .to_string(),
        image: trimmed(record.image.as_deref()).map(String::from),
      })
      .clone()
  }

  /// Adopt the projections carried by `entries`, keeping existing ones.
  pub fn absorb<'a>(&mut self, entries: impl IntoIterator<Item = &'a FeedEntry>) {
    for entry in entries {
      let actor = entry.actor();
      self
        .actors
        .entry(actor.id.clone())
        .or_insert_with(|| actor.clone());
      let ref_summary = entry.ref_summary();
      self
        .refs
        .entry(ref_summary.id.clone())
        .or_insert_with(|| ref_summary.clone());
    }
  }

  /// Adopt everything `other` knows that we don't.
  pub fn merge(&mut self, other: Projections) {
    for (id, actor) in other.actors {
      self.actors.entry(id).or_insert(actor);
    }
    for (id, ref_summary) in other.refs {
      self.refs.entry(id).or_insert(ref_summary);
    }
  }

  pub fn len(&self) -> (usize, usize) {
    (self.actors.len(), self.refs.len())
  }

  pub fn clear(&mut self) {
    self.actors.clear();
    self.refs.clear();
  }
}
