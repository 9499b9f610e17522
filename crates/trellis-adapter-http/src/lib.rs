//! HTTP peer for trellis.
//!
//! Talks to a remote CouchDB-compatible server, implementing [`Peer`] by
//! mapping each method onto the corresponding REST endpoint. Change feeds
//! are read one-shot, long-poll, continuous (newline-delimited) or over a
//! WebSocket.

mod auth;
mod feed;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite;

use trellis_core::document::{
    ChangesRequest, ChangesResponse, DocResult, FeedMode, PeerInfo, RevsDiffResponse, Seq,
};
use trellis_core::error::{Result, TrellisError};
use trellis_core::peer::{ChangeStream, Credentials, Peer};
use trellis_core::rev_id::RevId;

pub use auth::{AuthClient, Session, UserContext};
pub use feed::ChangesLineParser;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// CouchDB JSON response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CouchDbInfo {
    db_name: String,
    #[serde(default)]
    doc_count: u64,
    update_seq: Value, // integer or opaque string depending on the server
}

#[derive(Debug, Default, Deserialize)]
struct CouchDbError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Serialize)]
struct CouchDbBulkDocsRequest<'a> {
    docs: &'a [Value],
    new_edits: bool,
}

#[derive(Debug, Deserialize)]
struct CouchDbBulkDocsResult {
    ok: Option<bool>,
    id: Option<String>,
    rev: Option<String>,
    error: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CouchDbOpenRev {
    Found { ok: Value },
    Missing { missing: String },
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Classify an HTTP failure status.
pub fn error_for_status(status: u16, reason: String) -> TrellisError {
    match status {
        401 => TrellisError::Unauthorized,
        403 => TrellisError::Forbidden(reason),
        404 => TrellisError::NotFound(reason),
        409 => TrellisError::Conflict,
        408 | 429 | 500..=599 => TrellisError::TransientNetwork(format!("HTTP {status}: {reason}")),
        _ => TrellisError::PermanentNetwork { status, reason },
    }
}

pub(crate) fn transport_error(e: reqwest::Error) -> TrellisError {
    if e.is_decode() {
        TrellisError::Json(e.to_string())
    } else if e.is_builder() {
        TrellisError::BadRequest(e.to_string())
    } else if let Some(status) = e.status() {
        error_for_status(status.as_u16(), e.to_string())
    } else {
        TrellisError::TransientNetwork(e.to_string())
    }
}

fn socket_error(e: tungstenite::Error) -> TrellisError {
    match e {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            error_for_status(
                status.as_u16(),
                status.canonical_reason().unwrap_or_default().to_string(),
            )
        }
        tungstenite::Error::Url(e) => TrellisError::BadRequest(e.to_string()),
        other => TrellisError::TransientNetwork(other.to_string()),
    }
}

pub(crate) async fn check_error(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let body: CouchDbError = serde_json::from_str(&text).unwrap_or_default();
    let reason = match (body.error.is_empty(), body.reason.is_empty()) {
        (_, false) => body.reason,
        (false, true) => body.error,
        (true, true) => text,
    };
    Err(error_for_status(status.as_u16(), reason))
}

// ---------------------------------------------------------------------------
// HttpPeer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub credentials: Option<Credentials>,
    /// Extra headers sent with every request.
    pub headers: BTreeMap<String, String>,
    pub request_timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            credentials: None,
            headers: BTreeMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// A peer that talks to a remote CouchDB-compatible database.
pub struct HttpPeer {
    client: Client,
    base_url: String,
    options: HttpOptions,
}

impl HttpPeer {
    /// Point at a database URL such as `http://localhost:5984/mydb`.
    /// Credentials in the URL's userinfo are sent as basic auth.
    pub fn new(url: &str) -> Self {
        Self::with_options(url, HttpOptions::default())
    }

    pub fn with_options(url: &str, options: HttpOptions) -> Self {
        let client = Client::builder()
            .cookie_store(true)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            options,
        }
    }

    /// Like [`HttpPeer::with_options`], and logs in first when the
    /// credentials ask for a cookie session.
    pub async fn connect(url: &str, options: HttpOptions) -> Result<Self> {
        let peer = Self::with_options(url, options);
        if let Some(Credentials::Session { username, password }) = &peer.options.credentials {
            let auth = AuthClient::with_client(&auth::server_root(&peer.base_url)?, peer.client.clone());
            auth.login(username, password).await?;
        }
        Ok(peer)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// A request carrying the configured headers and credentials. Streamed
    /// feeds pass `None` so the body is not cut off by a total timeout.
    fn request(&self, method: Method, url: &str, timeout: Option<Duration>) -> RequestBuilder {
        let mut req = self.client.request(method, url);
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }
        for (name, value) in &self.options.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        match &self.options.credentials {
            Some(Credentials::Basic { username, password }) => {
                req.basic_auth(username, Some(password))
            }
            Some(Credentials::Bearer(token)) => req.bearer_auth(token),
            Some(Credentials::Session { .. }) | None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response> {
        let resp = req.send().await.map_err(transport_error)?;
        check_error(resp).await
    }

    fn local_url(&self, id: &str) -> String {
        self.url(&format!("_local/{}", urlencoded(id)))
    }

    async fn local_rev(&self, id: &str) -> Result<Option<String>> {
        Ok(self
            .get_local(id)
            .await?
            .and_then(|doc| doc.get("_rev").and_then(|r| r.as_str()).map(str::to_string)))
    }

    /// `Authorization` value for the socket handshake, which does not go
    /// through reqwest.
    fn socket_authorization(&self, url: &Url) -> Option<String> {
        match &self.options.credentials {
            Some(Credentials::Basic { username, password }) => Some(basic_header(username, password)),
            Some(Credentials::Bearer(token)) => Some(format!("Bearer {token}")),
            _ if !url.username().is_empty() => {
                Some(basic_header(url.username(), url.password().unwrap_or_default()))
            }
            _ => None,
        }
    }

    async fn open_socket(&self, request: &ChangesRequest) -> Result<ChangeStream> {
        use tungstenite::client::IntoClientRequest;
        use tungstenite::http::HeaderValue;

        let url = Url::parse(&self.url("_changes"))
            .map_err(|e| TrellisError::BadRequest(e.to_string()))?;
        let authorization = self.socket_authorization(&url);
        let ws_url = socket_url(&url)?;

        let mut handshake = ws_url
            .as_str()
            .into_client_request()
            .map_err(socket_error)?;
        let headers = handshake.headers_mut();
        for (name, value) in &self.options.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<tungstenite::http::HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        if let Some(auth) = authorization
            && let Ok(value) = HeaderValue::from_str(&auth)
        {
            headers.insert(tungstenite::http::header::AUTHORIZATION, value);
        }

        let connect = tokio_tungstenite::connect_async(handshake);
        let (mut socket, _) = tokio::time::timeout(self.options.request_timeout, connect)
            .await
            .map_err(|_| TrellisError::TransientNetwork("socket handshake timed out".into()))?
            .map_err(socket_error)?;
        socket
            .send(tungstenite::Message::Text(socket_options(request).to_string().into()))
            .await
            .map_err(socket_error)?;
        tracing::debug!(url = %ws_url, since = %request.since, "change socket open");

        let idle = request.heartbeat.unwrap_or(DEFAULT_HEARTBEAT) + self.options.request_timeout;
        let frames = socket.map(|frame| frame.map_err(socket_error));
        Ok(feed::socket_stream(frames, request.since.clone(), idle))
    }
}

#[async_trait]
impl Peer for HttpPeer {
    fn identity(&self) -> String {
        match Url::parse(&self.base_url) {
            Ok(mut url) => {
                let _ = url.set_username("");
                let _ = url.set_password(None);
                url.as_str().trim_end_matches('/').to_string()
            }
            Err(_) => self.base_url.clone(),
        }
    }

    async fn info(&self) -> Result<PeerInfo> {
        let req = self.request(Method::GET, &self.base_url, Some(self.options.request_timeout));
        let info: CouchDbInfo = self.send(req).await?.json().await.map_err(transport_error)?;
        Ok(PeerInfo {
            db_name: info.db_name,
            doc_count: info.doc_count,
            update_seq: Seq::from_json(&info.update_seq).unwrap_or_default(),
        })
    }

    async fn create_if_missing(&self) -> Result<()> {
        let req = self.request(Method::PUT, &self.base_url, Some(self.options.request_timeout));
        match self.send(req).await {
            Ok(_) => {
                tracing::info!(url = %self.identity(), "created remote database");
                Ok(())
            }
            Err(TrellisError::PermanentNetwork { status: 412, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn open_changes(&self, request: ChangesRequest) -> Result<ChangeStream> {
        if request.mode == FeedMode::Socket {
            return self.open_socket(&request).await;
        }

        let query = changes_query(&request);
        let url = self.url("_changes");
        let timeout = match request.mode {
            FeedMode::Continuous => None,
            FeedMode::LongPoll => {
                Some(self.options.request_timeout + request.timeout.unwrap_or_default())
            }
            _ => Some(self.options.request_timeout),
        };
        let req = match &request.doc_ids {
            Some(doc_ids) => self
                .request(Method::POST, &url, timeout)
                .json(&serde_json::json!({ "doc_ids": doc_ids })),
            None => self.request(Method::GET, &url, timeout),
        };
        let resp = self.send(req.query(&query)).await?;
        tracing::debug!(url = %url, mode = ?request.mode, since = %request.since, "change feed open");

        if request.mode == FeedMode::Continuous {
            let idle = request.heartbeat.unwrap_or(DEFAULT_HEARTBEAT) + self.options.request_timeout;
            let bytes = Box::pin(resp.bytes_stream().map(|chunk| chunk.map_err(transport_error)));
            return Ok(feed::continuous_stream(bytes, request.since, idle));
        }
        let response: ChangesResponse = resp.json().await.map_err(transport_error)?;
        Ok(feed::terminated_stream(response))
    }

    async fn revs_diff(&self, revs: HashMap<String, Vec<RevId>>) -> Result<RevsDiffResponse> {
        let body: HashMap<String, Vec<String>> = revs
            .into_iter()
            .map(|(id, revs)| (id, revs.iter().map(RevId::to_string).collect()))
            .collect();
        let req = self
            .request(Method::POST, &self.url("_revs_diff"), Some(self.options.request_timeout))
            .json(&body);
        self.send(req).await?.json().await.map_err(transport_error)
    }

    async fn upload_revisions(&self, docs: Vec<Value>) -> Result<Vec<DocResult>> {
        let req = self
            .request(Method::POST, &self.url("_bulk_docs"), Some(self.options.request_timeout))
            .json(&CouchDbBulkDocsRequest {
                docs: &docs,
                new_edits: false,
            });
        let results: Vec<CouchDbBulkDocsResult> =
            self.send(req).await?.json().await.map_err(transport_error)?;
        Ok(results
            .into_iter()
            .map(|r| DocResult {
                ok: r.ok.unwrap_or(r.error.is_none()),
                id: r.id.unwrap_or_default(),
                rev: r.rev,
                error: r.error,
                reason: r.reason,
            })
            .collect())
    }

    async fn get_revisions(
        &self,
        doc_id: &str,
        revs: &[RevId],
        known_ancestors: &[RevId],
    ) -> Result<Vec<Value>> {
        let open_revs: Vec<String> = revs.iter().map(RevId::to_string).collect();
        let mut query = vec![
            ("open_revs", serde_json::to_string(&open_revs)?),
            ("revs", "true".to_string()),
            ("latest", "true".to_string()),
        ];
        if !known_ancestors.is_empty() {
            let known: Vec<String> = known_ancestors.iter().map(RevId::to_string).collect();
            query.push(("atts_since", serde_json::to_string(&known)?));
        }
        let req = self
            .request(Method::GET, &self.url(&urlencoded(doc_id)), Some(self.options.request_timeout))
            .header("Accept", "application/json")
            .query(&query);
        let entries: Vec<CouchDbOpenRev> =
            self.send(req).await?.json().await.map_err(transport_error)?;
        let mut found = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                CouchDbOpenRev::Found { ok } => found.push(ok),
                CouchDbOpenRev::Missing { missing } => {
                    tracing::debug!(doc_id, rev = %missing, "revision missing on peer");
                }
            }
        }
        Ok(found)
    }

    async fn get_local(&self, id: &str) -> Result<Option<Value>> {
        let req = self.request(Method::GET, &self.local_url(id), Some(self.options.request_timeout));
        match self.send(req).await {
            Ok(resp) => Ok(Some(resp.json().await.map_err(transport_error)?)),
            Err(TrellisError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put_local(&self, id: &str, mut doc: Value) -> Result<()> {
        // _local docs still need the current _rev to be overwritten
        let rev = self.local_rev(id).await?;
        if let (Some(rev), Some(obj)) = (rev, doc.as_object_mut()) {
            obj.insert("_rev".into(), Value::String(rev));
        }
        let req = self
            .request(Method::PUT, &self.local_url(id), Some(self.options.request_timeout))
            .json(&doc);
        self.send(req).await?;
        Ok(())
    }

    async fn delete_local(&self, id: &str) -> Result<()> {
        let Some(rev) = self.local_rev(id).await? else {
            return Ok(());
        };
        let req = self
            .request(Method::DELETE, &self.local_url(id), Some(self.options.request_timeout))
            .query(&[("rev", rev)]);
        match self.send(req).await {
            Ok(_) | Err(TrellisError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Request building
// ---------------------------------------------------------------------------

fn feed_name(mode: FeedMode) -> &'static str {
    match mode {
        FeedMode::OneShot => "normal",
        FeedMode::LongPoll => "longpoll",
        FeedMode::Continuous => "continuous",
        FeedMode::Socket => "websocket",
    }
}

fn param_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Query parameters of a `_changes` request. `doc_ids` win over a named
/// filter; the IDs themselves travel in the POST body.
fn changes_query(request: &ChangesRequest) -> Vec<(String, String)> {
    let mut query = vec![
        ("feed".to_string(), feed_name(request.mode).to_string()),
        ("since".to_string(), request.since.to_query_string()),
    ];
    if request.all_leaves {
        query.push(("style".into(), "all_docs".into()));
    }
    if let Some(limit) = request.limit {
        query.push(("limit".into(), limit.to_string()));
    }
    if request.mode != FeedMode::OneShot {
        let heartbeat = request.heartbeat.unwrap_or(DEFAULT_HEARTBEAT);
        query.push(("heartbeat".into(), heartbeat.as_millis().to_string()));
    }
    if request.mode == FeedMode::LongPoll
        && let Some(timeout) = request.timeout
    {
        query.push(("timeout".into(), timeout.as_millis().to_string()));
    }
    if request.doc_ids.is_some() {
        query.push(("filter".into(), "_doc_ids".into()));
    } else if let Some(filter) = &request.filter {
        query.push(("filter".into(), filter.clone()));
        for (key, value) in &request.filter_params {
            query.push((key.clone(), param_value(value)));
        }
    }
    query
}

/// The first frame of a socket feed: the same options as query parameters,
/// as one JSON object.
fn socket_options(request: &ChangesRequest) -> Value {
    let mut options = serde_json::Map::new();
    options.insert("since".into(), request.since.to_json());
    options.insert(
        "heartbeat".into(),
        Value::from(request.heartbeat.unwrap_or(DEFAULT_HEARTBEAT).as_millis() as u64),
    );
    if request.all_leaves {
        options.insert("style".into(), "all_docs".into());
    }
    if let Some(limit) = request.limit {
        options.insert("limit".into(), limit.into());
    }
    if let Some(doc_ids) = &request.doc_ids {
        options.insert("filter".into(), "_doc_ids".into());
        options.insert("doc_ids".into(), doc_ids.clone().into());
    } else if let Some(filter) = &request.filter {
        options.insert("filter".into(), filter.clone().into());
        for (key, value) in &request.filter_params {
            options.insert(key.clone(), value.clone());
        }
    }
    Value::Object(options)
}

/// `ws(s)://` form of a `_changes` URL, without userinfo.
fn socket_url(changes_url: &Url) -> Result<Url> {
    let mut url = changes_url.clone();
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(TrellisError::BadRequest(format!(
                "cannot open a change socket over {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TrellisError::BadRequest(format!("cannot use scheme {scheme}")))?;
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.query_pairs_mut().append_pair("feed", "websocket");
    Ok(url)
}

fn basic_header(username: &str, password: &str) -> String {
    let token = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
    format!("Basic {token}")
}

/// Percent-encode a document ID for use as a path segment.
fn urlencoded(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
