//! Client and database handles: HTTP execution, session cookies, the
//! `_find` sender, the write path, and the changes-feed engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::header::{CONTENT_TYPE, COOKIE, IF_MATCH, SET_COOKIE};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use crate::changes::{
    parse_line, ChangesEvent, ChangesFeed, ChangesFilter, ChangesOptions, ChangesPage,
    ContinuousLine, FeedMode, LineBuffer,
};
use crate::compile::{CacheStats, QueryCompiler};
use crate::document::{AttachmentContent, Document};
use crate::error::{map_status, Error, Result};
use crate::naming::PropertyPolicy;
use crate::query::{ExecutionStats, FindResult, PipelineOp, QueryBuilder};

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(200);
const DEFAULT_TOKEN_DURATION: Duration = Duration::from_secs(10 * 60);

/// Characters CouchDB requires escaped in database names.
const DB_NAME_ESCAPE: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'+')
    .add(b'$')
    .add(b'(')
    .add(b')')
    .add(b' ')
    .add(b'%')
    .add(b'?')
    .add(b'#');

/// Escaping for document ids and attachment names in path segments.
const SEGMENT_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'+')
    .add(b'<')
    .add(b'>')
    .add(b'?');

pub(crate) fn escape_db_name(name: &str) -> String {
    utf8_percent_encode(name, DB_NAME_ESCAPE).to_string()
}

pub(crate) fn escape_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT_ESCAPE).to_string()
}

/// Cookie-auth parameters.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub name: String,
    pub password: String,
    /// How long an `AuthSession` cookie is trusted before re-login.
    pub token_duration: Duration,
}

impl Credentials {
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
            token_duration: DEFAULT_TOKEN_DURATION,
        }
    }

    pub fn with_token_duration(mut self, duration: Duration) -> Self {
        self.token_duration = duration;
        self
    }
}

#[derive(Default)]
struct Session {
    cookie: Option<String>,
    issued_at: Option<Instant>,
    /// Bumped on every login so concurrent 401s coalesce into one refresh.
    generation: u64,
}

struct ClientInner {
    http: reqwest::Client,
    endpoint: String,
    credentials: Option<Credentials>,
    session: Mutex<Session>,
    policy: PropertyPolicy,
    query_cache_size: usize,
    find_timeout: Option<Duration>,
    changes_heartbeat: Option<Duration>,
    id_prefix: Option<String>,
}

/// Entry point; one per server. Cheap to clone, shares the HTTP pool.
///
/// Created via [`CouchClient::builder`].
#[derive(Clone)]
pub struct CouchClient {
    inner: Arc<ClientInner>,
}

/// Builder for a fully configured client.
pub struct CouchClientBuilder {
    endpoint: String,
    credentials: Option<Credentials>,
    policy: PropertyPolicy,
    query_cache_size: usize,
    find_timeout: Option<Duration>,
    changes_heartbeat: Option<Duration>,
    connect_timeout: Duration,
    id_prefix: Option<String>,
}

impl CouchClient {
    /// Connect to a server with default settings.
    pub fn new(endpoint: &str) -> Result<Self> {
        Self::builder().endpoint(endpoint).build()
    }

    pub fn builder() -> CouchClientBuilder {
        CouchClientBuilder {
            endpoint: String::new(),
            credentials: None,
            policy: PropertyPolicy::default(),
            query_cache_size: 256,
            find_timeout: None,
            changes_heartbeat: None,
            connect_timeout: Duration::from_secs(30),
            id_prefix: None,
        }
    }

    /// A handle to one database. The handle's context is immutable.
    pub fn database(&self, name: &str) -> CouchDatabase {
        let ctx = QueryContext {
            endpoint: self.inner.endpoint.clone(),
            db_name: name.to_string(),
            escaped_db_name: escape_db_name(name),
        };
        CouchDatabase {
            inner: self.inner.clone(),
            compiler: Arc::new(QueryCompiler::new(
                self.inner.policy.clone(),
                self.inner.query_cache_size,
            )),
            ctx: Arc::new(ctx),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }
}

impl CouchClientBuilder {
    pub fn endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn property_policy(mut self, policy: PropertyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn query_cache_size(mut self, size: usize) -> Self {
        self.query_cache_size = size;
        self
    }

    /// Per-query deadline for `_find` requests.
    pub fn find_timeout(mut self, timeout: Duration) -> Self {
        self.find_timeout = Some(timeout);
        self
    }

    /// Default heartbeat for continuous feeds that don't set their own.
    pub fn changes_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.changes_heartbeat = Some(heartbeat);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Require every saved document id to carry this prefix; ids assigned
    /// by the client are minted under it.
    pub fn document_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = Some(prefix.into());
        self
    }

    pub fn build(self) -> Result<CouchClient> {
        if self.endpoint.is_empty() {
            return Err(Error::Transport("endpoint is required".to_string()));
        }
        // No global read timeout: continuous feeds legitimately block for
        // hours. Deadlines are applied per request where configured.
        let http = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(Error::from)?;

        Ok(CouchClient {
            inner: Arc::new(ClientInner {
                http,
                endpoint: self.endpoint,
                credentials: self.credentials,
                session: Mutex::new(Session::default()),
                policy: self.policy,
                query_cache_size: self.query_cache_size,
                find_timeout: self.find_timeout,
                changes_heartbeat: self.changes_heartbeat,
                id_prefix: self.id_prefix,
            }),
        })
    }
}

impl ClientInner {
    /// The current session cookie, refreshed if stale. Returns the session
    /// generation so a later 401 can tell whether someone else already
    /// re-logged in.
    async fn current_cookie(&self) -> Result<(Option<String>, u64)> {
        let Some(credentials) = &self.credentials else {
            return Ok((None, 0));
        };
        let mut session = self.session.lock().await;
        let stale = match session.issued_at {
            Some(issued_at) => Instant::now() >= issued_at + credentials.token_duration,
            None => true,
        };
        if session.cookie.is_none() || stale {
            self.login(&mut session, credentials).await?;
        }
        Ok((session.cookie.clone(), session.generation))
    }

    /// Re-login after a 401, unless another caller refreshed the session
    /// since the failing request read its cookie.
    async fn refresh_session(&self, observed_generation: u64) -> Result<()> {
        let Some(credentials) = &self.credentials else {
            return Ok(());
        };
        let mut session = self.session.lock().await;
        if session.generation == observed_generation {
            self.login(&mut session, credentials).await?;
        }
        Ok(())
    }

    async fn login(&self, session: &mut Session, credentials: &Credentials) -> Result<()> {
        let url = format!("{}/_session", self.endpoint);
        let resp = self
            .http
            .post(&url)
            .json(&json!({
                "name": credentials.name,
                "password": credentials.password,
            }))
            .send()
            .await
            .map_err(Error::from)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let cookie = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.starts_with("AuthSession="))
            .map(|v| v.split(';').next().unwrap_or(v).to_string());

        let Some(cookie) = cookie else {
            return Err(Error::Decode(
                "login response carried no AuthSession cookie".to_string(),
            ));
        };

        session.cookie = Some(cookie);
        session.issued_at = Some(Instant::now());
        session.generation += 1;
        tracing::info!(name = %credentials.name, "session established");
        Ok(())
    }

    /// Send a request with session cookie, one re-auth on 401, and
    /// exponential backoff for transport errors and 5xx responses.
    async fn execute(&self, base: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut attempt: u32 = 0;
        let mut reauthed = false;

        loop {
            let request = base
                .try_clone()
                .ok_or_else(|| Error::Transport("request body is not replayable".to_string()))?;

            let (cookie, generation) = self.current_cookie().await?;
            let request = match &cookie {
                Some(cookie) => request.header(COOKIE, cookie.as_str()),
                None => request,
            };

            let resp = match request.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    if attempt + 1 < MAX_ATTEMPTS {
                        let delay = backoff_delay(attempt);
                        tracing::warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "transport error, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(Error::from(e));
                }
            };

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }

            if status.as_u16() == 401 && !reauthed && self.credentials.is_some() {
                reauthed = true;
                self.refresh_session(generation).await?;
                continue;
            }

            let code = status.as_u16();
            let body = resp.text().await.unwrap_or_default();
            let err = map_status(code, &body);
            if err.is_retriable() && attempt + 1 < MAX_ATTEMPTS {
                let delay = backoff_delay(attempt);
                tracing::warn!(status = code, attempt, delay_ms = delay.as_millis() as u64, "server error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(err);
        }
    }
}

/// Exponential backoff with ±25% jitter: 200 ms, 400 ms, 800 ms bases.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BASE_BACKOFF.mul_f64(2f64.powi(attempt as i32));
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0x9e37_79b9);
    let mut x = nanos | 1;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    let factor = 0.75 + (x % 1001) as f64 / 2000.0;
    base.mul_f64(factor)
}

/// Immutable addressing context of one database handle.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub endpoint: String,
    pub db_name: String,
    pub escaped_db_name: String,
}

/// Handle to one database. Cheap to clone.
#[derive(Clone)]
pub struct CouchDatabase {
    inner: Arc<ClientInner>,
    compiler: Arc<QueryCompiler>,
    ctx: Arc<QueryContext>,
}

#[derive(Deserialize)]
struct WireFind {
    docs: Vec<Value>,
    #[serde(default)]
    bookmark: Option<String>,
    #[serde(default)]
    warning: Option<String>,
    #[serde(default)]
    execution_stats: Option<ExecutionStats>,
}

#[derive(Deserialize)]
struct WriteAck {
    #[serde(default)]
    id: String,
    rev: String,
}

#[derive(Deserialize)]
struct BulkDocResult {
    #[serde(default)]
    id: String,
    #[serde(default)]
    rev: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct BulkGetResponse {
    results: Vec<BulkGetResult>,
}

#[derive(Deserialize)]
struct BulkGetResult {
    #[serde(default)]
    docs: Vec<Value>,
}

impl CouchDatabase {
    pub fn context(&self) -> &QueryContext {
        &self.ctx
    }

    /// Hit/miss counters of this handle's translation cache.
    pub fn cache_stats(&self) -> CacheStats {
        self.compiler.cache_stats()
    }

    /// Start a typed query pipeline.
    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    fn db_url(&self, tail: &str) -> String {
        format!("{}/{}/{}", self.ctx.endpoint, self.ctx.escaped_db_name, tail)
    }

    fn doc_url(&self, id: &str) -> String {
        self.db_url(&escape_segment(id))
    }

    fn hydrate_doc<T>(&self, doc: &mut Document<T>) {
        let base = self.doc_url(&doc.id);
        doc.attachments
            .hydrate(&doc.id, doc.rev.as_deref(), &base);
    }

    pub(crate) fn compile_to_value(&self, ops: &[PipelineOp]) -> Result<Value> {
        Ok(self.compiler.compile(ops)?.to_value())
    }

    pub(crate) async fn run_find<T: DeserializeOwned>(
        &self,
        ops: &[PipelineOp],
    ) -> Result<FindResult<T>> {
        let query = self.compiler.compile(ops)?;
        self.post_find(query.to_body()).await
    }

    /// Run a caller-supplied Mango query string. Bypasses translation but
    /// hydrates rows identically.
    pub async fn find_raw<T: DeserializeOwned>(&self, body: &str) -> Result<FindResult<T>> {
        self.post_find(body.to_string()).await
    }

    /// Run a pre-built Mango query document.
    pub async fn find_json<T: DeserializeOwned>(&self, body: &Value) -> Result<FindResult<T>> {
        self.post_find(body.to_string()).await
    }

    async fn post_find<T: DeserializeOwned>(&self, body: String) -> Result<FindResult<T>> {
        let mut request = self
            .inner
            .http
            .post(self.db_url("_find"))
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(timeout) = self.inner.find_timeout {
            request = request.timeout(timeout);
        }

        tracing::debug!(db = %self.ctx.db_name, "posting _find");
        let resp = self.inner.execute(request).await?;
        let wire: WireFind = resp.json().await.map_err(Error::from)?;

        let mut docs = Vec::with_capacity(wire.docs.len());
        for value in wire.docs {
            let mut doc = Document::from_value(value)?;
            self.hydrate_doc(&mut doc);
            docs.push(doc);
        }
        Ok(FindResult {
            docs,
            bookmark: wire.bookmark,
            warning: wire.warning,
            execution_stats: wire.execution_stats,
        })
    }

    /// Fetch one document by id.
    ///
    /// The only operation that maps a clean 404 to `Ok(None)`; everywhere
    /// else a missing resource is an error.
    pub async fn get<T: DeserializeOwned>(&self, id: &str) -> Result<Option<Document<T>>> {
        let request = self.inner.http.get(self.doc_url(id));
        match self.inner.execute(request).await {
            Ok(resp) => {
                let value: Value = resp.json().await.map_err(Error::from)?;
                let mut doc = Document::from_value(value)?;
                self.hydrate_doc(&mut doc);
                Ok(Some(doc))
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch many documents by id via `_bulk_get`. Missing ids are omitted.
    pub async fn get_bulk<T: DeserializeOwned>(&self, ids: &[&str]) -> Result<Vec<Document<T>>> {
        let body = json!({
            "docs": ids.iter().map(|id| json!({ "id": id })).collect::<Vec<_>>(),
        });
        let request = self.inner.http.post(self.db_url("_bulk_get")).json(&body);
        let resp = self.inner.execute(request).await?;
        let wire: BulkGetResponse = resp.json().await.map_err(Error::from)?;

        let mut docs = Vec::new();
        for result in wire.results {
            for entry in result.docs {
                if let Some(ok) = entry.get("ok") {
                    let mut doc = Document::from_value(ok.clone())?;
                    self.hydrate_doc(&mut doc);
                    docs.push(doc);
                }
            }
        }
        Ok(docs)
    }

    /// Save one document and synchronize its attachments.
    pub async fn save<T: serde::Serialize>(&self, doc: &mut Document<T>) -> Result<()> {
        self.save_all(std::slice::from_mut(doc)).await
    }

    /// Write one document directly via `PUT /{db}/{id}`, skipping the bulk
    /// path and attachment synchronization. A stale rev surfaces `Conflict`.
    pub async fn put<T: serde::Serialize>(&self, doc: &mut Document<T>) -> Result<()> {
        if doc.id.is_empty() {
            let minted = uuid::Uuid::new_v4().simple().to_string();
            doc.id = match &self.inner.id_prefix {
                Some(prefix) => format!("{}{}", prefix, minted),
                None => minted,
            };
        }
        let body = serde_json::to_value(&*doc).map_err(Error::from)?;
        let request = self.inner.http.put(self.doc_url(&doc.id)).json(&body);
        let resp = self.inner.execute(request).await?;
        let ack: WriteAck = resp.json().await.map_err(Error::from)?;
        doc.rev = Some(ack.rev);
        Ok(())
    }

    /// Bulk-save documents via `_bulk_docs`, then synchronize attachments
    /// per document: uploads strictly before deletions, first failure
    /// aborts that document's remaining steps. `rev` reflects the last
    /// acknowledged step.
    pub async fn save_all<T: serde::Serialize>(&self, docs: &mut [Document<T>]) -> Result<()> {
        for doc in docs.iter_mut() {
            if doc.id.is_empty() {
                let minted = uuid::Uuid::new_v4().simple().to_string();
                doc.id = match &self.inner.id_prefix {
                    Some(prefix) => format!("{}{}", prefix, minted),
                    None => minted,
                };
            } else if let Some(prefix) = &self.inner.id_prefix {
                if !doc.id.starts_with(prefix.as_str()) {
                    return Err(Error::PreconditionFailed(format!(
                        "document id '{}' must start with '{}'",
                        doc.id, prefix
                    )));
                }
            }
        }

        let body: Vec<Value> = docs
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<_, _>>()
            .map_err(Error::from)?;
        let request = self
            .inner
            .http
            .post(self.db_url("_bulk_docs"))
            .json(&json!({ "docs": body }));
        let resp = self.inner.execute(request).await?;
        let results: Vec<BulkDocResult> = resp.json().await.map_err(Error::from)?;

        if results.len() != docs.len() {
            return Err(Error::Decode(format!(
                "_bulk_docs returned {} results for {} documents",
                results.len(),
                docs.len()
            )));
        }

        // Positional zip; successes apply even when a sibling failed.
        let mut first_error: Option<Error> = None;
        for (doc, result) in docs.iter_mut().zip(&results) {
            if let Some(error) = &result.error {
                if first_error.is_none() {
                    first_error = Some(map_bulk_error(error, result.reason.as_deref()));
                }
                continue;
            }
            if !result.id.is_empty() {
                doc.id = result.id.clone();
            }
            if let Some(rev) = &result.rev {
                doc.rev = Some(rev.clone());
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        for doc in docs.iter_mut() {
            self.sync_attachments(doc).await?;
        }
        Ok(())
    }

    /// Delete a document. The current rev is echoed via `If-Match`.
    pub async fn remove<T>(&self, doc: &mut Document<T>) -> Result<()> {
        let rev = doc.rev.clone().ok_or_else(|| {
            Error::PreconditionFailed("document has no rev to delete".to_string())
        })?;
        let request = self
            .inner
            .http
            .delete(self.doc_url(&doc.id))
            .header(IF_MATCH, rev);
        let resp = self.inner.execute(request).await?;
        let ack: WriteAck = resp.json().await.map_err(Error::from)?;
        doc.rev = Some(ack.rev);
        Ok(())
    }

    /// Apply staged attachment changes: uploads first, then deletions.
    async fn sync_attachments<T>(&self, doc: &mut Document<T>) -> Result<()> {
        let uploads: Vec<String> = doc
            .attachments
            .pending_uploads()
            .map(|a| a.name.clone())
            .collect();
        for name in uploads {
            let (content_type, content) = match doc.attachments.get(&name) {
                Some(att) => (att.content_type.clone(), att.content.clone()),
                None => continue,
            };
            let bytes = match content {
                AttachmentContent::Bytes(bytes) => bytes,
                AttachmentContent::File(path) => tokio::fs::read(&path).await?,
                AttachmentContent::None => continue,
            };
            let rev = doc.rev.clone().ok_or_else(|| {
                Error::PreconditionFailed(format!(
                    "document '{}' has no rev for attachment upload",
                    doc.id
                ))
            })?;

            let url = format!("{}/{}", self.doc_url(&doc.id), escape_segment(&name));
            let request = self
                .inner
                .http
                .put(url)
                .header(IF_MATCH, rev)
                .header(CONTENT_TYPE, content_type)
                .body(bytes);
            let resp = self.inner.execute(request).await?;
            let ack: WriteAck = resp.json().await.map_err(Error::from)?;
            tracing::debug!(doc = %ack.id, attachment = %name, rev = %ack.rev, "attachment uploaded");
            doc.attachments.confirm_upload(&name, &ack.rev);
            doc.rev = Some(ack.rev);
        }

        let deletes: Vec<String> = doc
            .attachments
            .pending_deletes()
            .map(|a| a.name.clone())
            .collect();
        for name in deletes {
            let rev = doc.rev.clone().ok_or_else(|| {
                Error::PreconditionFailed(format!(
                    "document '{}' has no rev for attachment delete",
                    doc.id
                ))
            })?;
            let url = format!("{}/{}", self.doc_url(&doc.id), escape_segment(&name));
            let request = self.inner.http.delete(url).header(IF_MATCH, rev);
            let resp = self.inner.execute(request).await?;
            let ack: WriteAck = resp.json().await.map_err(Error::from)?;
            tracing::debug!(doc = %doc.id, attachment = %name, rev = %ack.rev, "attachment deleted");
            doc.attachments.confirm_delete(&name);
            doc.rev = Some(ack.rev);
        }
        Ok(())
    }

    /// One-shot changes feed: the whole payload, immediately.
    pub async fn changes<T: DeserializeOwned>(
        &self,
        options: &ChangesOptions,
        filter: Option<&ChangesFilter>,
    ) -> Result<ChangesPage<T>> {
        self.changes_page(options, filter, FeedMode::Normal).await
    }

    /// Long-poll changes feed: blocks until the first change or the
    /// configured timeout.
    pub async fn changes_longpoll<T: DeserializeOwned>(
        &self,
        options: &ChangesOptions,
        filter: Option<&ChangesFilter>,
    ) -> Result<ChangesPage<T>> {
        self.changes_page(options, filter, FeedMode::LongPoll).await
    }

    async fn changes_page<T: DeserializeOwned>(
        &self,
        options: &ChangesOptions,
        filter: Option<&ChangesFilter>,
        mode: FeedMode,
    ) -> Result<ChangesPage<T>> {
        let request = self.changes_request(options, filter, mode)?;
        let resp = self.inner.execute(request).await?;
        let mut page: ChangesPage<T> = resp.json().await.map_err(Error::from)?;
        for event in &mut page.results {
            if let Some(doc) = &mut event.doc {
                self.hydrate_doc(doc);
            }
        }
        Ok(page)
    }

    /// Continuous changes feed: a cancellable stream of typed events.
    ///
    /// The consumer drives the pace; the reader parks on a single-slot
    /// hand-off until the previous event is taken.
    pub async fn changes_continuous<T: DeserializeOwned + Send + 'static>(
        &self,
        options: &ChangesOptions,
        filter: Option<&ChangesFilter>,
    ) -> Result<ChangesFeed<T>> {
        let mut options = options.clone();
        if options.heartbeat.is_none() {
            options.heartbeat = self.inner.changes_heartbeat;
        }

        let request = self.changes_request(&options, filter, FeedMode::Continuous)?;
        let mut resp = self.inner.execute(request).await?;
        tracing::info!(db = %self.ctx.db_name, "continuous changes feed opened");

        let (tx, rx) = mpsc::channel::<Result<ChangesEvent<T>>>(1);
        let db = self.clone();
        let reader = tokio::spawn(async move {
            let mut lines = LineBuffer::default();
            'read: loop {
                match resp.chunk().await {
                    Ok(Some(chunk)) => {
                        for line in lines.push(&chunk) {
                            match parse_line::<T>(&line) {
                                Ok(ContinuousLine::Heartbeat) => {}
                                Ok(ContinuousLine::Event(mut event)) => {
                                    if let Some(doc) = &mut event.doc {
                                        db.hydrate_doc(doc);
                                    }
                                    if tx.send(Ok(event)).await.is_err() {
                                        break 'read;
                                    }
                                }
                                Ok(ContinuousLine::End { .. }) => break 'read,
                                Err(e) => {
                                    tracing::warn!(error = %e, "unparseable changes line");
                                    let _ = tx.send(Err(e)).await;
                                    break 'read;
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(Error::from(e))).await;
                        break;
                    }
                }
            }
        });

        Ok(ChangesFeed::new(rx, reader))
    }

    fn changes_request(
        &self,
        options: &ChangesOptions,
        filter: Option<&ChangesFilter>,
        mode: FeedMode,
    ) -> Result<reqwest::RequestBuilder> {
        let mut params = options.to_params(mode);
        let (filter_params, body) = match filter {
            Some(filter) => filter.negotiate(&self.inner.policy)?,
            None => (Vec::new(), None),
        };
        params.extend(filter_params);

        let url = self.db_url("_changes");
        let request = match body {
            Some(body) => self.inner.http.post(url).query(&params).json(&body),
            None => self.inner.http.get(url).query(&params),
        };
        Ok(request)
    }
}

fn map_bulk_error(error: &str, reason: Option<&str>) -> Error {
    let message = match reason {
        Some(reason) => format!("{}: {}", error, reason),
        None => error.to_string(),
    };
    match error {
        "conflict" => Error::Conflict(message),
        "forbidden" => Error::Forbidden(message),
        "unauthorized" => Error::Unauthorized(message),
        _ => Error::Server {
            status: 500,
            reason: message,
        },
    }
}
