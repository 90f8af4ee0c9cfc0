//! Connection negotiation and WebSocket URL construction.
use balance_feed_engine::TransportError;
use bf_common::Secret;
use log::*;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

pub const NEGOTIATE_VERSION: &str = "1";
const MAX_REDIRECTS: usize = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    pub connection_id: Option<String>,
    pub connection_token: Option<String>,
    pub negotiate_version: Option<u32>,
    /// Set when the server redirects the client to another endpoint, e.g. a managed SignalR service.
    pub url: Option<String>,
    pub access_token: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub available_transports: Vec<AvailableTransport>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: String,
    #[serde(default)]
    pub transfer_formats: Vec<String>,
}

impl NegotiateResponse {
    /// The value sent as the `id` query parameter. Version 1 servers issue a token distinct from the connection id.
    pub fn connection_token(&self) -> Option<&str> {
        self.connection_token.as_deref().or(self.connection_id.as_deref())
    }

    pub fn supports_websockets(&self) -> bool {
        self.available_transports.is_empty()
            || self.available_transports.iter().any(|t| {
                t.transport == "WebSockets"
                    && (t.transfer_formats.is_empty() || t.transfer_formats.iter().any(|f| f == "Text"))
            })
    }
}

/// The outcome of negotiation: where to open the WebSocket, and with which token.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub url: Url,
    pub connection_token: Option<String>,
    pub access_token: Secret<String>,
}

/// Negotiates a connection with the hub, following at most one redirect.
pub async fn negotiate(
    client: &Client,
    hub_url: &Url,
    access_token: Secret<String>,
) -> Result<Negotiated, TransportError> {
    let mut url = hub_url.clone();
    let mut token = access_token;
    let mut redirects = 0;
    loop {
        let mut response = request(client, &url, &token).await?;
        if let Some(error) = response.error.take() {
            return Err(TransportError::Protocol(format!("Negotiation failed. {error}")));
        }
        if let Some(redirect) = response.url.take() {
            if redirects >= MAX_REDIRECTS {
                return Err(TransportError::Protocol("The hub redirected the client too many times".into()));
            }
            redirects += 1;
            url = Url::parse(&redirect)
                .map_err(|e| TransportError::Protocol(format!("Invalid redirect URL {redirect}. {e}")))?;
            if let Some(redirect_token) = response.access_token.take() {
                token = Secret::new(redirect_token);
            }
            info!("🔌️ Negotiation redirected to {}", url.host_str().unwrap_or_default());
            continue;
        }
        if !response.supports_websockets() {
            return Err(TransportError::Protocol("The hub does not offer the WebSockets transport".into()));
        }
        let connection_token = response.connection_token().map(str::to_string);
        debug!("🔌️ Negotiated connection {}", response.connection_id.as_deref().unwrap_or("(no id)"));
        return Ok(Negotiated { url, connection_token, access_token: token });
    }
}

async fn request(client: &Client, url: &Url, token: &Secret<String>) -> Result<NegotiateResponse, TransportError> {
    let endpoint = negotiate_url(url);
    trace!("🔌️ POST {}{}", endpoint.host_str().unwrap_or_default(), endpoint.path());
    let res = client
        .post(endpoint)
        .bearer_auth(token.reveal())
        .send()
        .await
        .map_err(|e| TransportError::Network(e.to_string()))?;
    let status = res.status();
    if !status.is_success() {
        let message = res.text().await.unwrap_or_default();
        return Err(TransportError::from_status(status.as_u16(), &message));
    }
    res.json::<NegotiateResponse>()
        .await
        .map_err(|e| TransportError::Protocol(format!("Invalid negotiate response. {e}")))
}

/// `<hub>/negotiate?negotiateVersion=1`, keeping any query the hub URL already has.
pub fn negotiate_url(hub_url: &Url) -> Url {
    let mut url = hub_url.clone();
    let path = format!("{}/negotiate", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().append_pair("negotiateVersion", NEGOTIATE_VERSION);
    url
}

/// Maps the hub URL onto the WebSocket scheme and adds the connection token and access token as query parameters.
pub fn websocket_url(
    hub_url: &Url,
    connection_token: Option<&str>,
    access_token: &Secret<String>,
) -> Result<Url, TransportError> {
    let mut url = hub_url.clone();
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(TransportError::Protocol(format!("Unsupported hub URL scheme: {other}"))),
    };
    url.set_scheme(scheme).map_err(|_| TransportError::Protocol(format!("Cannot use {scheme} for {hub_url}")))?;
    let mut params = Vec::with_capacity(2);
    if let Some(id) = connection_token {
        params.push(("id", id));
    }
    if !access_token.is_empty() {
        params.push(("access_token", access_token.reveal().as_str()));
    }
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }
    Ok(url)
}
