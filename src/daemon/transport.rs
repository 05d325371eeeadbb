//! Shared HTTP machinery for the three daemon clients: one `hyper` client per
//! connection, with either HTTP basic auth (bitcoind/geth convention) or
//! digest auth (monerod `--rpc-login`) layered over a plain JSON-RPC POST.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::StatusCode;
use hyper::client::connect::HttpConnector;
use hyper::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use hyper::{Body, Method, Request, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use log::debug;
use tokio::time::timeout;

use super::auth::AuthInfo;
use super::DaemonError;

/// A connection to one daemon's JSON-RPC endpoint, shared by the monero,
/// UTXO, and EVM clients.
#[derive(Clone)]
pub(crate) struct RpcTransport {
    client: hyper::Client<HttpsConnector<HttpConnector>>,
    url: Uri,
    timeout: Duration,
    basic_auth: Option<String>,
    digest_auth: Option<Arc<Mutex<AuthInfo>>>,
}

impl RpcTransport {
    pub fn new(
        url: Uri,
        timeout: Duration,
        connect_timeout: Duration,
        username: Option<String>,
        password: Option<String>,
        use_digest: bool,
    ) -> RpcTransport {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.enforce_http(false);
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);
        let client = hyper::Client::builder().build(https);

        let has_creds = username.is_some() || password.is_some();
        let (basic_auth, digest_auth) = match (has_creds, use_digest) {
            (false, _) => (None, None),
            (true, false) => (
                Some(BASE64.encode(format!(
                    "{}:{}",
                    username.unwrap_or_default(),
                    password.unwrap_or_default()
                ))),
                None,
            ),
            (true, true) => (
                None,
                Some(Arc::new(Mutex::new(AuthInfo::new(
                    username.unwrap_or_default(),
                    password.unwrap_or_default(),
                )))),
            ),
        };

        RpcTransport { client, url, timeout, basic_auth, digest_auth }
    }

    /// POSTs `body` to `endpoint` relative to the configured base url and
    /// parses the response as JSON.
    pub async fn post(&self, body: String, endpoint: &str) -> Result<serde_json::Value, DaemonError> {
        let uri: Uri = (self.url.to_string() + endpoint)
            .parse()
            .map_err(|_| DaemonError::MissingData("invalid endpoint url".to_string()))?;

        let mut req = Request::builder()
            .method(Method::POST)
            .uri(uri.clone())
            .header("content-type", "application/json");
        if let Some(basic) = &self.basic_auth {
            req = req.header(AUTHORIZATION, format!("Basic {basic}"));
        }
        if let Some(digest) = &self.digest_auth {
            let mut auth_info = digest.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(header) = auth_info.authenticate(&uri, &Method::POST)? {
                req = req.header(AUTHORIZATION, header);
            }
        }
        let request = req.body(Body::from(body.clone()))?;

        let mut response = timeout(self.timeout, self.client.request(request)).await??;

        if response.status() == StatusCode::UNAUTHORIZED
            && response.headers().contains_key(WWW_AUTHENTICATE)
        {
            let Some(digest) = &self.digest_auth else {
                return Err(DaemonError::RpcError("daemon demanded auth, none configured".to_string()));
            };
            debug!("received 401, retrying with digest authentication");
            let header = digest
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .authenticate_with_resp(&response, &uri, &Method::POST)?;
            let retry = Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header("content-type", "application/json")
                .header(AUTHORIZATION, header)
                .body(Body::from(body))?;
            response = timeout(self.timeout, self.client.request(retry)).await??;
        }

        let (_parts, body) = response.into_parts();
        let bytes = hyper::body::to_bytes(body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn url(&self) -> String {
        self.url.to_string()
    }
}
