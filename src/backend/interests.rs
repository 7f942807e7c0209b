use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use url::Url;

use crate::backend::api_types::ApiSubscriptionRow;
use crate::backend::source::InterestSource;
use crate::backend::types::SubscriptionRow;
use crate::config::{Config, InterestsConfig};

/// Interest-join rows from a PostgREST-style table endpoint.
#[derive(Clone)]
pub struct InterestClient {
  http: reqwest::Client,
  table_url: Url,
}

impl InterestClient {
  /// Client keyed with `FEEDCORE_INTERESTS_KEY`.
  pub fn new(config: &InterestsConfig) -> Result<Self> {
    Self::with_key(config, &Config::get_interests_key()?)
  }

  pub fn with_key(config: &InterestsConfig, key: &str) -> Result<Self> {
    let base = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid interests url {}: {}", config.url, e))?;
    let table_url = base
      .join("rest/v1/community_subscriptions")
      .map_err(|e| eyre!("Failed to build interests url: {}", e))?;

    let mut headers = HeaderMap::new();
    headers.insert(
      "apikey",
      HeaderValue::from_str(key).map_err(|e| eyre!("Invalid interests key: {}", e))?,
    );
    headers.insert(
      AUTHORIZATION,
      HeaderValue::from_str(&format!("Bearer {}", key))
        .map_err(|e| eyre!("Invalid interests key: {}", e))?,
    );

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create interests client: {}", e))?;

    Ok(Self { http, table_url })
  }
}

#[async_trait]
impl InterestSource for InterestClient {
  async fn list_subscriptions(
    &self,
    before: Option<DateTime<Utc>>,
    limit: usize,
  ) -> Result<Vec<SubscriptionRow>> {
    let mut url = self.table_url.clone();
    {
      let mut query = url.query_pairs_mut();
      query
        .append_pair("select", "id,ref_id,user_id,community,inserted_at")
        .append_pair("order", "inserted_at.desc")
        .append_pair("limit", &limit.to_string());
      if let Some(before) = before {
        query.append_pair(
          "inserted_at",
          &format!("lt.{}", before.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
      }
    }

    let rows: Vec<ApiSubscriptionRow> = self
      .http
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to load interest subscriptions: {}", e))?
      .error_for_status()
      .map_err(|e| eyre!("Interest subscriptions query rejected: {}", e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse interest subscriptions: {}", e))?;

    Ok(rows.into_iter().map(ApiSubscriptionRow::into_row).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::ts;
  use mockito::{Matcher, Server};
  use serde_json::json;

  fn client(server: &Server) -> InterestClient {
    let config = InterestsConfig { url: server.url() };
    InterestClient::with_key(&config, "anon-key").unwrap()
  }

  #[tokio::test]
  async fn test_cursor_becomes_lt_filter() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("GET", "/rest/v1/community_subscriptions")
      .match_header("apikey", "anon-key")
      .match_header("authorization", "Bearer anon-key")
      .match_query(Matcher::AllOf(vec![
        Matcher::UrlEncoded("select".into(), "id,ref_id,user_id,community,inserted_at".into()),
        Matcher::UrlEncoded("order".into(), "inserted_at.desc".into()),
        Matcher::UrlEncoded("limit".into(), "10".into()),
        Matcher::UrlEncoded("inserted_at".into(), "lt.2023-11-14T22:13:20.000Z".into()),
      ]))
      .with_status(200)
      .with_body(
        json!([
          {"id": "s1", "ref_id": "r1", "user_id": "u1", "community": "Climbing", "inserted_at": "2023-11-14T22:13:19.000Z"},
          {"id": "s2", "ref_id": "r2", "user_id": "u2", "community": null, "inserted_at": "not a date"}
        ])
        .to_string(),
      )
      .create_async()
      .await;

    let rows = client(&server)
      .list_subscriptions(Some(ts(0)), 10)
      .await
      .unwrap();

    mock.assert_async().await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].community.as_deref(), Some("Climbing"));
    assert_eq!(rows[0].inserted_at, Some(ts(-1)));
    assert_eq!(rows[1].inserted_at, None);
  }

  #[tokio::test]
  async fn test_first_page_has_no_cursor() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("GET", "/rest/v1/community_subscriptions")
      .match_query(Matcher::Regex("limit=3$".into()))
      .with_status(200)
      .with_body("[]")
      .create_async()
      .await;

    let rows = client(&server).list_subscriptions(None, 3).await.unwrap();
    mock.assert_async().await;
    assert!(rows.is_empty());
  }

  #[tokio::test]
  async fn test_rejected_query_is_an_error() {
    let mut server = Server::new_async().await;
    let _mock = server
      .mock("GET", "/rest/v1/community_subscriptions")
      .match_query(Matcher::Any)
      .with_status(401)
      .create_async()
      .await;

    assert!(client(&server).list_subscriptions(None, 3).await.is_err());
  }
}
