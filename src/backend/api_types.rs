//! Serde-deserializable types matching the backend wire formats.
//!
//! These types are separate from domain types so quirks of the wire format
//! (empty-string relations, space-separated timestamps) stay out of the rest
//! of the crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{ItemExpand, ItemRecord, ProfileRecord, RefRecord, SubscriptionRow};

/// Parse a record-store or PostgREST timestamp.
///
/// Accepts RFC 3339 and the record store's `YYYY-MM-DD HH:MM:SS.sssZ` form.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
  let normalized = value.trim().replacen(' ', "T", 1);
  DateTime::parse_from_rfc3339(&normalized).map(|dt| dt.with_timezone(&Utc))
}

fn non_empty(value: String) -> Option<String> {
  if value.trim().is_empty() {
    None
  } else {
    Some(value)
  }
}

// ============================================================================
// Record store list response
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiListResponse<T> {
  pub page: u32,
  pub per_page: u32,
  pub total_items: u64,
  #[serde(default = "Vec::new")]
  pub items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiItemExpand {
  pub creator: Option<ProfileRecord>,
  #[serde(rename = "ref")]
  pub ref_record: Option<RefRecord>,
}

/// Item as returned by the record store. Unset relations come back as `""`.
#[derive(Debug, Deserialize)]
pub struct ApiItem {
  pub id: String,
  pub created: String,
  #[serde(default)]
  pub creator: String,
  #[serde(default, rename = "ref")]
  pub ref_id: String,
  #[serde(default)]
  pub backlog: bool,
  #[serde(default)]
  pub list: bool,
  #[serde(default)]
  pub parent: String,
  #[serde(default)]
  pub image: String,
  #[serde(default)]
  pub text: String,
  #[serde(default)]
  pub expand: Option<ApiItemExpand>,
}

impl ApiItem {
  pub fn into_record(self) -> Result<ItemRecord, chrono::ParseError> {
    let created = parse_timestamp(&self.created)?;
    let expand = self.expand.unwrap_or_default();
    Ok(ItemRecord {
      id: self.id,
      created,
      creator: non_empty(self.creator),
      ref_id: non_empty(self.ref_id),
      backlog: self.backlog,
      list: self.list,
      parent: non_empty(self.parent),
      image: non_empty(self.image),
      text: non_empty(self.text),
      expand: ItemExpand {
        creator: expand.creator,
        ref_record: expand.ref_record,
      },
    })
  }
}

// ============================================================================
// Interest source rows
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiSubscriptionRow {
  pub id: String,
  pub ref_id: String,
  pub user_id: String,
  pub community: Option<String>,
  pub inserted_at: Option<String>,
}

impl ApiSubscriptionRow {
  /// Unparseable timestamps are kept as `None`; the feed skips such rows.
  pub fn into_row(self) -> SubscriptionRow {
    SubscriptionRow {
      inserted_at: self
        .inserted_at
        .as_deref()
        .and_then(|ts| parse_timestamp(ts).ok()),
      id: self.id,
      ref_id: self.ref_id,
      user_id: self.user_id,
      community: self.community,
    }
  }
}

// ============================================================================
// Signing service
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiSignRequest<'a> {
  pub url: &'a str,
  pub expires: u64,
  pub date: i64,
  pub method: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct ApiSignResponse {
  pub data: String,
}
