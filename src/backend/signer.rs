use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use url::Url;

use crate::backend::api_types::{ApiSignRequest, ApiSignResponse};
use crate::backend::source::UrlSigner;
use crate::backend::types::SignedUrl;
use crate::config::{Config, ImagesConfig};

/// Client for the image gateway's `files/sign` endpoint
#[derive(Clone)]
pub struct GatewaySigner {
  http: reqwest::Client,
  endpoint: Url,
  expires_secs: u64,
}

impl GatewaySigner {
  /// Signer authenticated with `FEEDCORE_SIGNING_TOKEN` or `PINATA_JWT`.
  pub fn new(config: &ImagesConfig) -> Result<Self> {
    Self::with_token(config, &Config::get_signing_token()?)
  }

  pub fn with_token(config: &ImagesConfig, token: &str) -> Result<Self> {
    let endpoint = Url::parse(&config.sign_endpoint)
      .map_err(|e| eyre!("Invalid sign endpoint {}: {}", config.sign_endpoint, e))?;

    let mut headers = HeaderMap::new();
    headers.insert(
      AUTHORIZATION,
      HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| eyre!("Invalid signing token: {}", e))?,
    );

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create signing client: {}", e))?;

    Ok(Self {
      http,
      endpoint,
      expires_secs: config.expires_secs,
    })
  }
}

#[async_trait]
impl UrlSigner for GatewaySigner {
  async fn sign_url(&self, url: &str) -> Result<SignedUrl> {
    let date = chrono::Utc::now().timestamp_millis();
    let body = ApiSignRequest {
      url,
      expires: self.expires_secs,
      date,
      method: "GET",
    };

    let response: ApiSignResponse = self
      .http
      .post(self.endpoint.clone())
      .json(&body)
      .send()
      .await
      .map_err(|e| eyre!("Failed to sign {}: {}", url, e))?
      .error_for_status()
      .map_err(|e| eyre!("Signing service rejected {}: {}", url, e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse signing response: {}", e))?;

    Ok(SignedUrl {
      signed_url: response.data,
      expires: self.expires_secs,
      date,
    })
  }
}
