use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User profile as stored by the record source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
  pub id: String,
  pub user_name: String,
  #[serde(default)]
  pub first_name: Option<String>,
  #[serde(default)]
  pub last_name: Option<String>,
  /// Free-form full name, used when first/last are empty
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub image: Option<String>,
  #[serde(default)]
  pub avatar_url: Option<String>,
}

/// A ref (the thing an item points at)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefRecord {
  pub id: String,
  #[serde(default)]
  pub title: Option<String>,
  #[serde(default)]
  pub image: Option<String>,
}

/// Relations expanded inline on an item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemExpand {
  #[serde(default)]
  pub creator: Option<ProfileRecord>,
  #[serde(default, rename = "ref")]
  pub ref_record: Option<RefRecord>,
}

/// A user's item, with `creator` and `ref` optionally expanded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
  pub id: String,
  pub created: DateTime<Utc>,
  #[serde(default)]
  pub creator: Option<String>,
  #[serde(default, rename = "ref")]
  pub ref_id: Option<String>,
  #[serde(default)]
  pub backlog: bool,
  /// Item is itself a list
  #[serde(default)]
  pub list: bool,
  /// Owning list, if the item is a child of one
  #[serde(default)]
  pub parent: Option<String>,
  #[serde(default)]
  pub image: Option<String>,
  #[serde(default)]
  pub text: Option<String>,
  #[serde(default)]
  pub expand: ItemExpand,
}

/// Someone joining an interest community
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRow {
  pub id: String,
  pub ref_id: String,
  pub user_id: String,
  #[serde(default)]
  pub community: Option<String>,
  #[serde(default)]
  pub inserted_at: Option<DateTime<Utc>>,
}

/// One page of a paged record query
#[derive(Debug, Clone, PartialEq)]
pub struct ListPage<T> {
  pub items: Vec<T>,
  pub page: u32,
  pub per_page: u32,
  pub total_items: u64,
}

impl<T> ListPage<T> {
  /// More rows exist past this page.
  pub fn has_more(&self) -> bool {
    self.total_items > u64::from(self.page) * u64::from(self.per_page)
  }
}

/// Result of signing a gateway URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
  pub signed_url: String,
  /// Validity in seconds, counted from `date`
  pub expires: u64,
  /// Signing time, epoch milliseconds
  pub date: i64,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_has_more_uses_total_items() {
    let page = ListPage::<()> {
      items: Vec::new(),
      page: 1,
      per_page: 15,
      total_items: 40,
    };
    assert!(page.has_more());

    let last = ListPage::<()> {
      items: Vec::new(),
      page: 3,
      per_page: 15,
      total_items: 40,
    };
    assert!(!last.has_more());
  }

  #[test]
  fn test_item_record_reads_expanded_relations() {
    let json = r#"{
      "id": "i1",
      "created": "2024-05-01T10:00:00Z",
      "creator": "u1",
      "ref": "r1",
      "expand": {
        "creator": {"id": "u1", "userName": "alice", "firstName": "Alice"},
        "ref": {"id": "r1", "title": "Coffee"}
      }
    }"#;
    let item: ItemRecord = serde_json::from_str(json).unwrap();
    assert_eq!(item.ref_id.as_deref(), Some("r1"));
    assert!(!item.backlog);
    assert_eq!(item.expand.creator.unwrap().user_name, "alice");
    assert_eq!(item.expand.ref_record.unwrap().title.as_deref(), Some("Coffee"));
  }
}
