//! Item predicates, rendered for the record source and evaluable in memory.

use chrono::{DateTime, Utc};

use super::types::ItemRecord;

/// The item queries the loaders issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemFilter {
  /// Feed-eligible items: have a creator, not in a backlog, not a list, not
  /// inside a list. Optionally strictly older than `before`.
  Feed { before: Option<DateTime<Utc>> },
  /// A user's grid: non-backlog top-level items.
  Grid { creator_id: String },
  /// A user's backlog: backlog top-level items.
  Backlog { creator_id: String },
}

impl ItemFilter {
  /// Render as a record-source filter expression.
  pub fn expression(&self) -> String {
    match self {
      Self::Feed { before } => {
        let mut parts = vec![
          r#"creator != """#.to_string(),
          "backlog = false".to_string(),
          "list = false".to_string(),
          "parent = null".to_string(),
        ];
        if let Some(before) = before {
          parts.push(format!(r#"created < "{}""#, format_timestamp(before)));
        }
        parts.join(" && ")
      }
      Self::Grid { creator_id } => format!(
        r#"creator = "{}" && backlog = false && parent = null"#,
        escape(creator_id)
      ),
      Self::Backlog { creator_id } => format!(
        r#"creator = "{}" && backlog = true && parent = null"#,
        escape(creator_id)
      ),
    }
  }

  /// Evaluate against an item.
  pub fn matches(&self, item: &ItemRecord) -> bool {
    match self {
      Self::Feed { before } => {
        let has_creator = item.creator.as_deref().is_some_and(|c| !c.is_empty());
        let older = before.map_or(true, |before| item.created < before);
        has_creator && !item.backlog && !item.list && item.parent.is_none() && older
      }
      Self::Grid { creator_id } => {
        item.creator.as_deref() == Some(creator_id.as_str())
          && !item.backlog
          && item.parent.is_none()
      }
      Self::Backlog { creator_id } => {
        item.creator.as_deref() == Some(creator_id.as_str())
          && item.backlog
          && item.parent.is_none()
      }
    }
  }
}

/// A paged, newest-first item query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemQuery {
  pub filter: ItemFilter,
  pub page: u32,
  pub per_page: u32,
  /// Relations to expand inline
  pub expand: &'static str,
}

impl ItemQuery {
  pub fn new(filter: ItemFilter, per_page: u32) -> Self {
    Self {
      filter,
      page: 1,
      per_page,
      expand: "ref,creator",
    }
  }

  pub const SORT: &'static str = "-created";
}

/// Record-source timestamps use a space instead of `T`.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
  ts.format("%Y-%m-%d %H:%M:%S%.3fZ").to_string()
}

fn escape(value: &str) -> String {
  value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::types::ItemExpand;
  use chrono::TimeZone;

  fn item(created: DateTime<Utc>) -> ItemRecord {
    ItemRecord {
      id: "i1".into(),
      created,
      creator: Some("u1".into()),
      ref_id: Some("r1".into()),
      backlog: false,
      list: false,
      parent: None,
      image: None,
      text: None,
      expand: ItemExpand::default(),
    }
  }

  #[test]
  fn test_feed_expression_with_cursor() {
    let before = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    let filter = ItemFilter::Feed {
      before: Some(before),
    };
    assert_eq!(
      filter.expression(),
      r#"creator != "" && backlog = false && list = false && parent = null && created < "2024-05-01 10:00:00.000Z""#
    );
  }

  #[test]
  fn test_feed_predicate_excludes_ineligible_items() {
    let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    let filter = ItemFilter::Feed { before: None };
    assert!(filter.matches(&item(ts)));

    let mut no_creator = item(ts);
    no_creator.creator = Some(String::new());
    assert!(!filter.matches(&no_creator));

    let mut backlog = item(ts);
    backlog.backlog = true;
    assert!(!filter.matches(&backlog));

    let mut list = item(ts);
    list.list = true;
    assert!(!filter.matches(&list));

    let mut child = item(ts);
    child.parent = Some("l1".into());
    assert!(!filter.matches(&child));
  }

  #[test]
  fn test_feed_cursor_is_strict() {
    let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    let filter = ItemFilter::Feed { before: Some(ts) };
    assert!(!filter.matches(&item(ts)));
    assert!(filter.matches(&item(ts - chrono::Duration::seconds(1))));
  }

  #[test]
  fn test_grid_expression_escapes_quotes() {
    let filter = ItemFilter::Grid {
      creator_id: r#"a"b"#.into(),
    };
    assert_eq!(
      filter.expression(),
      r#"creator = "a\"b" && backlog = false && parent = null"#
    );
  }
}
