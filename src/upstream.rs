use crate::directory::Directory;
use crate::error::GatewayError;
use crate::model::ClientSecret;
use bytes::Bytes;
use dashmap::DashMap;
use hyper::client::HttpConnector;
use hyper::header::{
    HeaderValue, ACCEPT, AUTHORIZATION, CONNECTION, CONTENT_TYPE, HOST, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use hyper::{Body, Client, Method, Request, Response, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use std::sync::Arc;
use std::time::Duration;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Shared connection pool for every upstream.
pub fn build_http_client() -> HttpClient {
    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();

    Client::builder()
        .pool_idle_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(64)
        .build::<_, Body>(https)
}

/// Fully read non-streaming upstream answer.
pub struct UpstreamReply {
    pub status: http::StatusCode,
    pub headers: hyper::HeaderMap,
    pub body: Bytes,
}

/// Reusable handle bound to one client's endpoint and secret.
pub struct UpstreamClient {
    pub client_id: u64,
    base: Uri,
    auth_header: HeaderValue,
    http: HttpClient,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(secret: &ClientSecret, http: HttpClient, timeout: Duration) -> Result<Self, GatewayError> {
        let base = parse_endpoint(&secret.endpoint)
            .map_err(|e| GatewayError::Configuration(format!("client {}: {e}", secret.client_id)))?;
        let auth_header = bearer(&secret.api_key)
            .map_err(|e| GatewayError::Configuration(format!("client {}: {e}", secret.client_id)))?;
        Ok(Self {
            client_id: secret.client_id,
            base,
            auth_header,
            http,
            timeout,
        })
    }

    pub fn build_uri(&self, path: &str) -> anyhow::Result<Uri> {
        join_uri(&self.base, path)
    }

    /// POSTs `body` and reads the whole response within the request timeout.
    pub async fn call(&self, path: &str, body: Bytes) -> Result<UpstreamReply, GatewayError> {
        let uri = self
            .build_uri(path)
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;
        let req = json_post(uri, self.auth_header.clone(), body)?;
        let http = self.http.clone();
        let fut = async move {
            let resp = http.request(req).await?;
            let (parts, body) = resp.into_parts();
            let body = hyper::body::to_bytes(body).await?;
            Ok::<_, hyper::Error>(UpstreamReply {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        };
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                tracing::warn!(client_id = self.client_id, error = %e, "upstream transport error");
                Err(GatewayError::UpstreamFailure(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(client_id = self.client_id, "upstream request timeout");
                Err(GatewayError::UpstreamTimeout)
            }
        }
    }
}

/// Per-process cache of upstream handles keyed by client id.
///
/// Entries are created on first use from the directory and live until
/// [`UpstreamPool::invalidate`] drops them. A parallel secret cache feeds the
/// streaming path, which issues raw requests instead of going through a handle.
pub struct UpstreamPool {
    directory: Arc<dyn Directory>,
    http: HttpClient,
    timeout: Duration,
    handles: DashMap<u64, Arc<UpstreamClient>>,
    secrets: DashMap<u64, ClientSecret>,
}

impl UpstreamPool {
    pub fn new(directory: Arc<dyn Directory>, http: HttpClient, timeout: Duration) -> Self {
        Self {
            directory,
            http,
            timeout,
            handles: DashMap::new(),
            secrets: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, client_id: u64) -> Result<Arc<UpstreamClient>, GatewayError> {
        if let Some(h) = self.handles.get(&client_id) {
            return Ok(h.value().clone());
        }
        let secret = self
            .directory
            .find_client_secret(client_id)?
            .ok_or_else(|| GatewayError::Configuration(format!("client {client_id} has no secret")))?;
        let handle = Arc::new(UpstreamClient::new(&secret, self.http.clone(), self.timeout)?);
        let handle = self.handles.entry(client_id).or_insert(handle).value().clone();
        self.secrets.entry(client_id).or_insert(secret);
        tracing::debug!(client_id, "upstream handle created");
        Ok(handle)
    }

    pub fn secret(&self, client_id: u64) -> Option<ClientSecret> {
        self.secrets.get(&client_id).map(|s| s.value().clone())
    }

    /// Forgets the cached handle and secret; the next request reloads both.
    pub fn invalidate(&self, client_id: u64) {
        self.handles.remove(&client_id);
        self.secrets.remove(&client_id);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Opens a streaming call; only the time to response headers is bounded.
    pub async fn open_stream(
        &self,
        client_id: u64,
        path: &str,
        body: Bytes,
    ) -> Result<Response<Body>, GatewayError> {
        let secret = match self.secret(client_id) {
            Some(s) => s,
            None => {
                self.get_or_create(client_id)?;
                self.secret(client_id).ok_or_else(|| {
                    GatewayError::Configuration(format!("client {client_id} has no secret"))
                })?
            }
        };
        let base = parse_endpoint(&secret.endpoint)
            .map_err(|e| GatewayError::Configuration(format!("client {client_id}: {e}")))?;
        let uri = join_uri(&base, path).map_err(|e| GatewayError::Configuration(e.to_string()))?;
        let auth = bearer(&secret.api_key)
            .map_err(|e| GatewayError::Configuration(format!("client {client_id}: {e}")))?;
        let mut req = json_post(uri, auth, body)?;
        req.headers_mut()
            .insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        match tokio::time::timeout(self.timeout, self.http.request(req)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => {
                tracing::warn!(client_id, error = %e, "upstream stream open failed");
                Err(GatewayError::UpstreamFailure(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(client_id, "upstream stream open timeout");
                Err(GatewayError::UpstreamTimeout)
            }
        }
    }
}

fn parse_endpoint(endpoint: &str) -> anyhow::Result<Uri> {
    let base: Uri = endpoint.trim().parse()?;
    if base.scheme().is_none() {
        anyhow::bail!("endpoint missing scheme");
    }
    if base.authority().is_none() {
        anyhow::bail!("endpoint missing authority");
    }
    Ok(base)
}

fn bearer(api_key: &str) -> anyhow::Result<HeaderValue> {
    HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
        .map_err(|_| anyhow::anyhow!("api key cannot be used in an HTTP header"))
}

fn json_post(uri: Uri, auth: HeaderValue, body: Bytes) -> Result<Request<Body>, GatewayError> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(AUTHORIZATION, auth)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(|e| GatewayError::UpstreamFailure(e.to_string()))
}

/// Joins the endpoint's base path with an API path such as `/chat/completions`.
pub fn join_uri(base: &Uri, path: &str) -> anyhow::Result<Uri> {
    let base_path = base.path().trim_end_matches('/');
    let mut joined = String::with_capacity(base_path.len() + path.len() + 1);
    joined.push_str(base_path);
    joined.push('/');
    joined.push_str(path.trim_start_matches('/'));

    let mut parts = http::uri::Parts::default();
    parts.scheme = base.scheme().cloned();
    parts.authority = base.authority().cloned();
    parts.path_and_query = Some(joined.parse()?);
    Ok(Uri::from_parts(parts)?)
}

/// Remove hop-by-hop headers that should not be forwarded.
#[inline]
pub fn sanitize_hop_headers(headers: &mut hyper::HeaderMap) {
    headers.remove(CONNECTION);
    headers.remove(HOST);
    headers.remove("proxy-connection");
    headers.remove(PROXY_AUTHENTICATE);
    headers.remove(PROXY_AUTHORIZATION);
    headers.remove(TE);
    headers.remove(TRAILER);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(UPGRADE);
    headers.remove("x-admin-token");
}
