//! Durable state for the harvester: the session file, the raw page archive, the
//! record store, and the retrying HTTP client shared by the session probe and the
//! embedding client.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use harvest_core::{IngestionRecord, Session};
use reqwest::header::COOKIE;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// Lowercase, dash-separated form of a free-text name, safe for file paths.
pub fn slugify(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Writes `bytes` to a sibling temp file and renames it over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw listing pages, kept for audit and replay.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn page_relative_path(
        &self,
        run_id: Uuid,
        collection: &str,
        page_index: usize,
        content_hash: &str,
    ) -> PathBuf {
        let short_hash = &content_hash[..content_hash.len().min(16)];
        PathBuf::from(run_id.to_string())
            .join(slugify(collection))
            .join(format!("page-{page_index:04}-{short_hash}.html"))
    }

    pub async fn store_page(
        &self,
        run_id: Uuid,
        collection: &str,
        page_index: usize,
        html: &str,
    ) -> anyhow::Result<ArchivedPage> {
        let bytes = html.as_bytes();
        let content_hash = sha256_hex(bytes);
        let relative_path = self.page_relative_path(run_id, collection, page_index, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes).await?;
        }

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_scope_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_scope_concurrency: 4,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// At most `requests` request starts per `per` window, with bursts up to `requests`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub per: Duration,
}

impl RateLimitConfig {
    /// `None` for a zero rate, which means unlimited.
    pub fn per_minute(requests: u32) -> Option<Self> {
        (requests > 0).then(|| Self {
            requests,
            per: Duration::from_secs(60),
        })
    }
}

/// Token bucket refilled one token every `per / requests`.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    interval: Duration,
    state: Mutex<RateLimiterState>,
}

#[derive(Debug)]
struct RateLimiterState {
    tokens: u32,
    refilled_at: Instant,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = config.requests.max(1);
        Self {
            capacity,
            interval: (config.per / capacity).max(Duration::from_millis(1)),
            state: Mutex::new(RateLimiterState {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Waits for a token. Waiters queue on the state lock, so they are served in order.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();
            let earned = (now - state.refilled_at).as_nanos() / self.interval.as_nanos();
            if earned > 0 {
                let earned = u32::try_from(earned).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(earned).min(self.capacity);
                state.refilled_at = if state.tokens == self.capacity {
                    now
                } else {
                    state.refilled_at + self.interval * earned
                };
            }
            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }
            tokio::time::sleep_until(state.refilled_at + self.interval).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request limiter closed")]
    LimiterClosed,
}

/// Retrying HTTP client with a global and a per-scope concurrency limit.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_scope_limit: usize,
    per_scope: Mutex<HashMap<String, Arc<Semaphore>>>,
    rate_limiter: Option<RateLimiter>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let rate_limiter = config.rate_limit.map(RateLimiter::new);

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_scope_limit: config.per_scope_concurrency.max(1),
            per_scope: Mutex::new(HashMap::new()),
            rate_limiter,
            backoff: config.backoff,
        })
    }

    async fn per_scope_semaphore(&self, scope: &str) -> Arc<Semaphore> {
        let mut map = self.per_scope.lock().await;
        map.entry(scope.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_scope_limit)))
            .clone()
    }

    /// Sends the request produced by `build`, rebuilding it for every retry attempt.
    pub async fn send<F>(&self, scope: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_scope = self.per_scope_semaphore(scope).await;
        let _scope = per_scope
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let mut attempt = 0usize;
        loop {
            let request = build(&self.client).build()?;
            let url = request.url().to_string();
            let span = info_span!("http_request", scope, %url, attempt);
            let resp_result = self.client.execute(request).instrument(span).await;
            let can_retry = attempt < self.backoff.max_retries;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(scope, %url, error = %err, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

/// Liveness check for a stored session against the target system.
#[async_trait]
pub trait SessionProbe: Send + Sync {
    async fn is_authenticated(&self, session: &Session) -> anyhow::Result<bool>;
}

/// Requests an authenticated-only URL with the session cookies attached.
pub struct HttpSessionProbe {
    fetcher: Arc<HttpFetcher>,
    probe_url: String,
    login_markers: Vec<String>,
}

impl HttpSessionProbe {
    pub fn new(fetcher: Arc<HttpFetcher>, probe_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            probe_url: probe_url.into(),
            login_markers: ["login", "signin", "sign-in", "/auth", "/sso"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    pub fn with_login_markers(mut self, markers: Vec<String>) -> Self {
        self.login_markers = markers;
        self
    }

    /// Markers are matched against the path only, so hosts like `sso-jira.corp` do not
    /// read as a login page.
    fn lands_on_login(&self, final_url: &str) -> bool {
        let path = match reqwest::Url::parse(final_url) {
            Ok(url) => url.path().to_ascii_lowercase(),
            Err(_) => final_url.to_ascii_lowercase(),
        };
        self.login_markers
            .iter()
            .any(|m| path.contains(&m.to_ascii_lowercase()))
    }
}

#[async_trait]
impl SessionProbe for HttpSessionProbe {
    async fn is_authenticated(&self, session: &Session) -> anyhow::Result<bool> {
        let cookie_header = session.cookie_header();
        let result = self
            .fetcher
            .send("session-probe", |client| {
                client
                    .get(&self.probe_url)
                    .header(COOKIE, cookie_header.as_str())
            })
            .await;
        match result {
            Ok(resp) => Ok(!self.lands_on_login(&resp.final_url)),
            Err(FetchError::HttpStatus { status, .. }) if status == 401 || status == 403 => {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Single-writer store for the authenticated cookie set.
#[derive(Clone)]
pub struct SessionStore {
    path: PathBuf,
    probe: Option<Arc<dyn SessionProbe>>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn SessionProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrites any previous session file.
    pub async fn save(&self, session: &Session) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(session).context("serializing session")?;
        write_atomic(&self.path, &bytes).await?;
        debug!(path = %self.path.display(), cookies = session.cookies.len(), "session saved");
        Ok(())
    }

    /// Missing and unreadable files both load as `None`.
    pub async fn load(&self) -> Option<Session> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "session file unreadable");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(session) => Some(session),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "session file corrupt; ignoring");
                None
            }
        }
    }

    pub async fn is_fresh(&self, session: Option<&Session>) -> bool {
        let Some(session) = session.filter(|s| !s.is_empty()) else {
            return false;
        };
        let Some(probe) = &self.probe else {
            debug!("no session probe configured; treating session as stale");
            return false;
        };
        match probe.is_authenticated(session).await {
            Ok(alive) => alive,
            Err(err) => {
                warn!(error = %err, "session liveness probe failed");
                false
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageWriteError {
    #[error("database write failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("batch write timed out after {0:?}")]
    Timeout(Duration),
    #[error("store rejected batch: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub written: usize,
    pub errors: Vec<String>,
}

/// Destination for ingestion records. Implementations upsert on `external_id`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(&self, records: &[IngestionRecord]) -> Result<UpsertOutcome, StorageWriteError>;
    async fn count(&self) -> Result<usize, StorageWriteError>;
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to record store database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running record store migrations")
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert(
        &self,
        records: &[IngestionRecord],
    ) -> Result<UpsertOutcome, StorageWriteError> {
        if records.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        let now = chrono::Utc::now();
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO harvested_records \
                (external_id, title, status, priority, embedding, vectorized, metadata, first_seen_at, last_upserted_at) ",
        );
        builder.push_values(records, |mut row, record| {
            row.push_bind(record.external_id.clone())
                .push_bind(record.title.clone())
                .push_bind(record.status.clone())
                .push_bind(record.priority.clone())
                .push_bind(record.embedding.clone())
                .push_bind(record.metadata.vectorized)
                .push_bind(Json(record.metadata.clone()))
                .push_bind(now)
                .push_bind(now);
        });
        builder.push(
            " ON CONFLICT (external_id) DO UPDATE SET \
                title = EXCLUDED.title, \
                status = EXCLUDED.status, \
                priority = EXCLUDED.priority, \
                embedding = EXCLUDED.embedding, \
                vectorized = EXCLUDED.vectorized, \
                metadata = EXCLUDED.metadata, \
                last_upserted_at = EXCLUDED.last_upserted_at",
        );
        let result = builder.build().execute(&self.pool).await?;
        Ok(UpsertOutcome {
            written: result.rows_affected() as usize,
            errors: Vec::new(),
        })
    }

    async fn count(&self) -> Result<usize, StorageWriteError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM harvested_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }
}

/// Keyed in-memory store used for dry runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<String, IngestionRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, external_id: &str) -> Option<IngestionRecord> {
        self.records.lock().await.get(external_id).cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert(
        &self,
        records: &[IngestionRecord],
    ) -> Result<UpsertOutcome, StorageWriteError> {
        let mut map = self.records.lock().await;
        for record in records {
            map.insert(record.external_id.clone(), record.clone());
        }
        Ok(UpsertOutcome {
            written: records.len(),
            errors: Vec::new(),
        })
    }

    async fn count(&self) -> Result<usize, StorageWriteError> {
        Ok(self.records.lock().await.len())
    }
}
