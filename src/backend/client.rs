use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::backend::api_types::{ApiItem, ApiListResponse};
use crate::backend::query::ItemQuery;
use crate::backend::source::RecordSource;
use crate::backend::types::{ItemRecord, ListPage, ProfileRecord, RefRecord};
use crate::config::{BackendConfig, Config};

/// Upper bound on ids per lookup request.
const MAX_LOOKUP_PAGE: usize = 200;

/// Record store API client
#[derive(Clone)]
pub struct RecordStoreClient {
  http: reqwest::Client,
  base: Url,
}

impl RecordStoreClient {
  /// Client authenticated with `FEEDCORE_BACKEND_TOKEN`, if set.
  pub fn new(config: &BackendConfig) -> Result<Self> {
    Self::with_token(config, Config::get_backend_token())
  }

  pub fn with_token(config: &BackendConfig, token: Option<String>) -> Result<Self> {
    let base = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid backend url {}: {}", config.url, e))?;

    let mut headers = HeaderMap::new();
    if let Some(token) = token {
      let value = HeaderValue::from_str(&token)
        .map_err(|e| eyre!("Backend token is not a valid header value: {}", e))?;
      headers.insert(AUTHORIZATION, value);
    }

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create backend client: {}", e))?;

    Ok(Self { http, base })
  }

  fn records_url(&self, collection: &str) -> Result<Url> {
    self
      .base
      .join(&format!("api/collections/{}/records", collection))
      .map_err(|e| eyre!("Failed to build url for {}: {}", collection, e))
  }

  async fn get_list<T: DeserializeOwned>(
    &self,
    collection: &str,
    params: &[(&str, String)],
  ) -> Result<ApiListResponse<T>> {
    let mut url = self.records_url(collection)?;
    url.query_pairs_mut().extend_pairs(params);
    debug!(%url, "record store request");

    let response = self
      .http
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to query {}: {}", collection, e))?
      .error_for_status()
      .map_err(|e| eyre!("Record store rejected {} query: {}", collection, e))?;

    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {} response: {}", collection, e))
  }

  /// Look up records by id, in chunks the record store accepts.
  async fn by_ids<T: DeserializeOwned>(&self, collection: &str, ids: &[String]) -> Result<Vec<T>> {
    let mut records = Vec::new();
    for chunk in ids.chunks(MAX_LOOKUP_PAGE) {
      let filter = chunk
        .iter()
        .map(|id| format!(r#"id = "{}""#, id.replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(" || ");

      let response: ApiListResponse<T> = self
        .get_list(
          collection,
          &[
            ("page", "1".to_string()),
            ("perPage", chunk.len().max(1).to_string()),
            ("filter", filter),
            ("sort", "-created".to_string()),
          ],
        )
        .await?;
      records.extend(response.items);
    }
    Ok(records)
  }
}

#[async_trait]
impl RecordSource for RecordStoreClient {
  async fn list_items(&self, query: &ItemQuery) -> Result<ListPage<ItemRecord>> {
    let response: ApiListResponse<ApiItem> = self
      .get_list(
        "items",
        &[
          ("page", query.page.to_string()),
          ("perPage", query.per_page.to_string()),
          ("filter", query.filter.expression()),
          ("sort", ItemQuery::SORT.to_string()),
          ("expand", query.expand.to_string()),
        ],
      )
      .await?;

    let items = response
      .items
      .into_iter()
      .filter_map(|item| {
        let id = item.id.clone();
        match item.into_record() {
          Ok(record) => Some(record),
          Err(e) => {
            warn!(item = %id, error = %e, "skipping item with invalid timestamp");
            None
          }
        }
      })
      .collect();

    Ok(ListPage {
      items,
      page: response.page,
      per_page: response.per_page,
      total_items: response.total_items,
    })
  }

  async fn profile_by_user_name(&self, user_name: &str) -> Result<ProfileRecord> {
    let filter = format!(r#"userName = "{}""#, user_name.replace('"', "\\\""));
    let response: ApiListResponse<ProfileRecord> = self
      .get_list(
        "users",
        &[
          ("page", "1".to_string()),
          ("perPage", "1".to_string()),
          ("filter", filter),
        ],
      )
      .await?;

    response
      .items
      .into_iter()
      .next()
      .ok_or_else(|| eyre!("No user named {}", user_name))
  }

  async fn profiles_by_ids(&self, ids: &[String]) -> Result<Vec<ProfileRecord>> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    self.by_ids("users", ids).await
  }

  async fn refs_by_ids(&self, ids: &[String]) -> Result<Vec<RefRecord>> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    self.by_ids("refs", ids).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::query::ItemFilter;
  use crate::testing::ts;
  use mockito::{Matcher, Server};
  use serde_json::json;

  fn client(server: &Server, token: Option<&str>) -> RecordStoreClient {
    let config = BackendConfig { url: server.url() };
    RecordStoreClient::with_token(&config, token.map(str::to_string)).unwrap()
  }

  #[tokio::test]
  async fn test_list_items_sends_feed_query() {
    let mut server = Server::new_async().await;
    let filter = ItemFilter::Feed {
      before: Some(ts(0)),
    };
    assert!(filter
      .expression()
      .ends_with(r#"created < "2023-11-14 22:13:20.000Z""#));

    let mock = server
      .mock("GET", "/api/collections/items/records")
      .match_header("authorization", "secret")
      .match_query(Matcher::AllOf(vec![
        Matcher::UrlEncoded("page".into(), "1".into()),
        Matcher::UrlEncoded("perPage".into(), "5".into()),
        Matcher::UrlEncoded("filter".into(), filter.expression()),
        Matcher::UrlEncoded("sort".into(), "-created".into()),
        Matcher::UrlEncoded("expand".into(), "ref,creator".into()),
      ]))
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(
        json!({
          "page": 1,
          "perPage": 5,
          "totalItems": 12,
          "items": [
            {"id": "i1", "created": "2023-11-14 22:13:19.000Z", "creator": "u1", "ref": "r1"},
            {"id": "i2", "created": "2023-11-14 22:13:18.000Z", "creator": "u1", "ref": ""}
          ]
        })
        .to_string(),
      )
      .create_async()
      .await;

    let page = client(&server, Some("secret"))
      .list_items(&ItemQuery::new(filter, 5))
      .await
      .unwrap();

    mock.assert_async().await;
    assert_eq!(page.total_items, 12);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].created, ts(-1));
    assert_eq!(page.items[0].ref_id.as_deref(), Some("r1"));
    assert_eq!(page.items[1].ref_id, None);
  }

  #[tokio::test]
  async fn test_unparsable_item_is_skipped() {
    let mut server = Server::new_async().await;
    let _mock = server
      .mock("GET", "/api/collections/items/records")
      .match_query(Matcher::Any)
      .with_status(200)
      .with_body(
        json!({
          "page": 1,
          "perPage": 5,
          "totalItems": 2,
          "items": [
            {"id": "bad", "created": "yesterday", "creator": "u1"},
            {"id": "good", "created": "2023-11-14 22:13:20.000Z", "creator": "u1"}
          ]
        })
        .to_string(),
      )
      .create_async()
      .await;

    let page = client(&server, None)
      .list_items(&ItemQuery::new(ItemFilter::Feed { before: None }, 5))
      .await
      .unwrap();

    let ids: Vec<&str> = page.items.iter().map(|item| item.id.as_str()).collect();
    assert_eq!(ids, vec!["good"]);
    assert_eq!(page.total_items, 2);
  }

  #[tokio::test]
  async fn test_lookups_are_chunked() {
    let mut server = Server::new_async().await;
    let ids: Vec<String> = (0..250).map(|i| format!("r{i}")).collect();

    let first = server
      .mock("GET", "/api/collections/refs/records")
      .match_query(Matcher::UrlEncoded("perPage".into(), "200".into()))
      .with_status(200)
      .with_body(json!({"page": 1, "perPage": 200, "totalItems": 1, "items": [{"id": "r0"}]}).to_string())
      .create_async()
      .await;
    let second = server
      .mock("GET", "/api/collections/refs/records")
      .match_query(Matcher::UrlEncoded("perPage".into(), "50".into()))
      .with_status(200)
      .with_body(json!({"page": 1, "perPage": 50, "totalItems": 1, "items": [{"id": "r249"}]}).to_string())
      .create_async()
      .await;

    let refs = client(&server, None).refs_by_ids(&ids).await.unwrap();

    first.assert_async().await;
    second.assert_async().await;
    let found: Vec<&str> = refs.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(found, vec!["r0", "r249"]);
  }

  #[tokio::test]
  async fn test_profile_lookup_filter() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("GET", "/api/collections/users/records")
      .match_query(Matcher::AllOf(vec![
        Matcher::UrlEncoded("filter".into(), r#"id = "a" || id = "b""#.into()),
        Matcher::UrlEncoded("perPage".into(), "2".into()),
        Matcher::UrlEncoded("sort".into(), "-created".into()),
      ]))
      .with_status(200)
      .with_body(
        json!({
          "page": 1,
          "perPage": 2,
          "totalItems": 2,
          "items": [{"id": "a", "userName": "alice"}, {"id": "b", "userName": "bob"}]
        })
        .to_string(),
      )
      .create_async()
      .await;

    let client = client(&server, None);
    assert!(client.profiles_by_ids(&[]).await.unwrap().is_empty());
    let profiles = client
      .profiles_by_ids(&["a".to_string(), "b".to_string()])
      .await
      .unwrap();

    mock.assert_async().await;
    assert_eq!(profiles[1].user_name, "bob");
  }

  #[tokio::test]
  async fn test_server_error_is_an_error() {
    let mut server = Server::new_async().await;
    let _mock = server
      .mock("GET", "/api/collections/users/records")
      .match_query(Matcher::Any)
      .with_status(500)
      .create_async()
      .await;

    let result = client(&server, None).profile_by_user_name("alice").await;
    assert!(result.is_err());
  }
}
