//! Bulk desired-state API client.
//!
//! ```text
//!   GET {base}/bulk/apps?batch_size=N&bulk_token=<percent-encoded JSON>
//!   Authorization: Basic base64(user:password)
//!
//!   200 {"results": {app_id: DesiredAppState, ...}, "bulk_token": {...}}
//! ```
//!
//! The token is opaque: the first request sends `{}` and every later
//! request echoes the token from the previous page.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::Uri;
use http_body_util::{BodyExt, Empty};
use hm_core::{BulkCredentials, DesiredAppState};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use tracing::debug;

use crate::error::{FetchError, FetchResult};

/// One page of the bulk API.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BulkPage {
    #[serde(default)]
    pub results: BTreeMap<String, DesiredAppState>,
    #[serde(default)]
    pub bulk_token: serde_json::Value,
}

impl BulkPage {
    /// An empty page marks the end of a pass.
    pub fn is_last(&self) -> bool {
        self.results.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BulkClient {
    authority: String,
    prefix: String,
    timeout: Duration,
}

impl BulkClient {
    /// `base_url` must be a plain `http://host[:port][/prefix]` URL.
    pub fn new(base_url: &str, timeout: Duration) -> FetchResult<Self> {
        let uri: Uri = base_url
            .parse()
            .map_err(|_| FetchError::InvalidUrl(base_url.to_string()))?;
        if uri.scheme_str() != Some("http") {
            return Err(FetchError::InvalidUrl(base_url.to_string()));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| FetchError::InvalidUrl(base_url.to_string()))?;
        let authority = match authority.port_u16() {
            Some(_) => authority.to_string(),
            None => format!("{}:80", authority.host()),
        };

        Ok(Self {
            authority,
            prefix: uri.path().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Request URI for one page.
    pub fn page_uri(&self, token: &serde_json::Value, batch_size: u32) -> String {
        let token = utf8_percent_encode(&token.to_string(), NON_ALPHANUMERIC).to_string();
        format!(
            "http://{}{}/bulk/apps?batch_size={batch_size}&bulk_token={token}",
            self.authority, self.prefix
        )
    }

    pub async fn fetch_page(
        &self,
        credentials: &BulkCredentials,
        token: &serde_json::Value,
        batch_size: u32,
    ) -> FetchResult<BulkPage> {
        let uri = self.page_uri(token, batch_size);
        let body = tokio::time::timeout(self.timeout, self.get(&uri, credentials))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))??;

        let page: BulkPage =
            serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))?;
        debug!(%uri, apps = page.results.len(), "fetched bulk page");
        Ok(page)
    }

    async fn get(&self, uri: &str, credentials: &BulkCredentials) -> FetchResult<Bytes> {
        let stream = tokio::net::TcpStream::connect(&self.authority)
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(uri)
            .header("host", &self.authority)
            .header("authorization", basic_auth(credentials))
            .header("user-agent", "hm-fetcher/0.1")
            .body(Empty::<Bytes>::new())
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = resp.status();
        if status == http::StatusCode::UNAUTHORIZED {
            return Err(FetchError::Unauthorized);
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(body.to_bytes())
    }
}

fn basic_auth(credentials: &BulkCredentials) -> String {
    let raw = format!("{}:{}", credentials.user, credentials.password);
    format!("Basic {}", STANDARD.encode(raw))
}
