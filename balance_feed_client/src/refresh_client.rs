//! An HTTP client for the auth service's token refresh endpoint.
use balance_feed_engine::{RefreshError, TokenPair, TokenRefresher};
use log::*;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT},
    Client,
    StatusCode,
};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Some deployments wrap the pair in a `data` envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum RefreshResponse {
    Plain(TokenPair),
    Wrapped { data: TokenPair },
}

impl From<RefreshResponse> for TokenPair {
    fn from(response: RefreshResponse) -> Self {
        match response {
            RefreshResponse::Plain(pair) => pair,
            RefreshResponse::Wrapped { data } => data,
        }
    }
}

#[derive(Clone)]
pub struct HttpTokenRefresher {
    client: Client,
    url: Url,
}

impl HttpTokenRefresher {
    pub fn new(url: Url) -> Result<Self, RefreshError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .user_agent(concat!("balance-feed/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(|e| RefreshError::Network(format!("Could not create the HTTP client. {e}")))?;
        Ok(Self { client, url })
    }
}

impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, RefreshError> {
        debug!("🔑️ Requesting a new token pair from {}", self.url);
        let res = self
            .client
            .post(self.url.clone())
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;
        match res.status() {
            StatusCode::OK => {
                let response =
                    res.json::<RefreshResponse>().await.map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
                trace!("🔑️ Received a new token pair");
                Ok(response.into())
            },
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let status = res.status();
                let reason = res.text().await.unwrap_or_default();
                Err(RefreshError::Rejected(format!("HTTP {status}. {reason}")))
            },
            status => {
                let reason = res.text().await.unwrap_or_default();
                Err(RefreshError::Network(format!("HTTP {status}. {reason}")))
            },
        }
    }
}
