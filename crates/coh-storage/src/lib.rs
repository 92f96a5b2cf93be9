//! Rate-limited HTTP fetching plus key-value and dataset storage for COH.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use coh_core::{FetchOutcome, Opportunity};
use rand::Rng;
use reqwest::header::{self, HeaderMap, HeaderValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "coh-storage";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 429 and every 5xx are throttling signals; other non-2xx statuses are permanent.
pub fn classify_status(status: u16) -> RetryDisposition {
    if status == 429 || (500..600).contains(&status) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
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

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Baseline spacing between any two outbound calls of the pipeline.
    pub min_interval: Duration,
    pub max_backoff: Duration,
    /// Adds up to 25% random extra delay while backing off.
    pub jitter: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterStats {
    pub granted: u64,
    pub succeeded: u64,
    pub throttled: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct LimiterState {
    last_grant: Option<Instant>,
    hold_until: Option<Instant>,
    consecutive_throttles: u32,
    stats: LimiterStats,
}

/// One gate shared by every outbound call of a run.
///
/// `acquire` reserves the next free slot under the lock and sleeps outside it,
/// so any number of tasks can wait at once while state changes stay serialized.
/// Callers report each result; throttles double the spacing (capped), a success
/// drops it straight back to `min_interval`.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    backoff: BackoffPolicy,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            backoff: BackoffPolicy {
                base_delay: config.min_interval,
                max_delay: config.max_backoff.max(config.min_interval),
            },
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Spacing without jitter after `throttles` consecutive throttled calls.
    pub fn spacing_for(&self, throttles: u32) -> Duration {
        if throttles == 0 {
            self.config.min_interval
        } else {
            self.backoff.delay_for_attempt(throttles as usize)
        }
    }

    fn jittered(&self, throttles: u32) -> Duration {
        let base = self.spacing_for(throttles);
        if !self.config.jitter || throttles == 0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..0.25);
        (base + base.mul_f64(extra)).min(self.backoff.max_delay)
    }

    /// Waits for the next slot and returns how long the caller was held.
    pub async fn acquire(&self) -> Duration {
        let wait = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let mut slot = now;
            if let Some(last) = state.last_grant {
                slot = slot.max(last + self.jittered(state.consecutive_throttles));
            }
            if let Some(hold) = state.hold_until {
                slot = slot.max(hold);
            }
            state.last_grant = Some(slot);
            state.stats.granted += 1;
            slot.saturating_duration_since(now)
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        wait
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_throttles = 0;
        state.hold_until = None;
        state.stats.succeeded += 1;
    }

    /// Escalates the backoff and returns the hold applied to the next caller.
    pub async fn record_throttled(&self) -> Duration {
        let mut state = self.state.lock().await;
        state.consecutive_throttles = state.consecutive_throttles.saturating_add(1);
        state.stats.throttled += 1;
        let delay = self.jittered(state.consecutive_throttles);
        let until = Instant::now() + delay;
        state.hold_until = Some(state.hold_until.map_or(until, |hold| hold.max(until)));
        delay
    }

    /// Non-throttling failure (404, malformed request): backoff is left as is.
    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.stats.failed += 1;
    }

    pub async fn current_spacing(&self) -> Duration {
        let state = self.state.lock().await;
        self.spacing_for(state.consecutive_throttles)
    }

    pub async fn stats(&self) -> LimiterStats {
        self.state.lock().await.stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    Json,
    Binary,
}

impl Accept {
    fn header_value(self) -> &'static str {
        match self {
            Self::Json => "application/hal+json, application/json",
            Self::Binary => "*/*",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub accept: Accept,
}

impl HttpRequest {
    pub fn json(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            accept: Accept::Json,
        }
    }

    pub fn binary(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            accept: Accept::Binary,
        }
    }

    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        Self {
            retryable: classify_reqwest_error(&err) == RetryDisposition::Retryable,
            message: err.to_string(),
        }
    }
}

/// Single GET round trip with no retry or pacing of its own.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Sent as `X-Api-Key` when present.
    pub api_key: Option<String>,
    pub max_attempts: usize,
    pub rate_limit: RateLimitConfig,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            api_key: None,
            max_attempts: 3,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        headers.insert(header::REFERER, HeaderValue::from_static("https://sam.gov/search/"));
        headers.insert(header::ORIGIN, HeaderValue::from_static("https://sam.gov"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .get(&request.url)
            .query(&request.query)
            .header(header::ACCEPT, request.accept.header_value());
        if let Some(api_key) = &self.api_key {
            builder = builder.header("X-Api-Key", api_key);
        }

        let resp = builder.send().await.map_err(TransportError::from_reqwest)?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let body = resp
            .bytes()
            .await
            .map_err(TransportError::from_reqwest)?
            .to_vec();

        Ok(HttpResponse {
            status,
            final_url,
            body,
        })
    }
}

/// Canned replies for an in-process transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    Response { status: u16, body: Vec<u8> },
    NetworkError { message: String, retryable: bool },
}

/// In-process transport that answers from per-URL reply queues.
///
/// Each call pops the next reply for its URL; the last queued reply keeps
/// answering once the queue is down to one. Unknown URLs get a 404.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: std::sync::Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    requests: std::sync::Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, url: &str, reply: ScriptedReply) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.entry(url.to_string()).or_default().push_back(reply);
    }

    pub fn push_json(&self, url: &str, status: u16, body: &serde_json::Value) {
        self.push(
            url,
            ScriptedReply::Response {
                status,
                body: body.to_string().into_bytes(),
            },
        );
    }

    pub fn push_bytes(&self, url: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.push(
            url,
            ScriptedReply::Response {
                status,
                body: body.into(),
            },
        );
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.url == url)
            .count()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let reply = {
            let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
            match routes.get_mut(&request.url) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match reply {
            Some(ScriptedReply::Response { status, body }) => Ok(HttpResponse {
                status,
                final_url: request.url.clone(),
                body,
            }),
            Some(ScriptedReply::NetworkError { message, retryable }) => {
                Err(TransportError { message, retryable })
            }
            None => Ok(HttpResponse {
                status: 404,
                final_url: request.url.clone(),
                body: Vec::new(),
            }),
        }
    }
}

/// Every outbound call goes through here: shared gate, classification, bounded retries.
pub struct HttpFetcher {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    max_attempts: usize,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("limiter", &self.limiter)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl HttpFetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<RateLimiter>,
        max_attempts: usize,
    ) -> Self {
        Self {
            transport,
            limiter,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(config)?;
        Ok(Self::new(
            Arc::new(transport),
            Arc::new(RateLimiter::new(config.rate_limit)),
            config.max_attempts,
        ))
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// One attempt: wait for the gate, send, classify, report back to the limiter.
    ///
    /// Statuses listed in `accepted` are handed back as successes so callers can
    /// give them their own meaning (a 404 listing is an empty listing).
    pub async fn fetch_once(
        &self,
        request: &HttpRequest,
        accepted: &[u16],
    ) -> FetchOutcome<HttpResponse> {
        self.limiter.acquire().await;

        match self.transport.get(request).await {
            Ok(resp) if resp.is_success() || accepted.contains(&resp.status) => {
                self.limiter.record_success().await;
                FetchOutcome::Success(resp)
            }
            Ok(resp) => {
                let reason = format!("http status {} for {}", resp.status, resp.final_url);
                if classify_status(resp.status) == RetryDisposition::Retryable {
                    let hold = self.limiter.record_throttled().await;
                    debug!(status = resp.status, ?hold, "throttled response");
                    FetchOutcome::RetryableFailure(reason)
                } else {
                    self.limiter.record_failure().await;
                    FetchOutcome::FatalFailure(reason)
                }
            }
            Err(err) if err.retryable => {
                self.limiter.record_throttled().await;
                FetchOutcome::RetryableFailure(format!("request to {} failed: {err}", request.url))
            }
            Err(err) => {
                self.limiter.record_failure().await;
                FetchOutcome::FatalFailure(format!("request to {} failed: {err}", request.url))
            }
        }
    }

    /// Retries retryable failures up to `max_attempts`, then reports them as fatal.
    pub async fn fetch(&self, request: &HttpRequest) -> FetchOutcome<HttpResponse> {
        self.fetch_accepting(request, &[]).await
    }

    pub async fn fetch_accepting(
        &self,
        request: &HttpRequest,
        accepted: &[u16],
    ) -> FetchOutcome<HttpResponse> {
        let span = info_span!("http_fetch", url = %request.url);
        async {
            let mut last = FetchOutcome::FatalFailure("no attempt made".to_string());
            for attempt in 1..=self.max_attempts {
                match self.fetch_once(request, accepted).await {
                    FetchOutcome::RetryableFailure(reason) => {
                        warn!(attempt, max_attempts = self.max_attempts, %reason, "retryable failure");
                        last = FetchOutcome::RetryableFailure(reason);
                    }
                    done => return done,
                }
            }
            last.exhausted(self.max_attempts)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid storage key {0:?}")]
    InvalidKey(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing record: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn io_error(context: String) -> impl FnOnce(std::io::Error) -> StoreError {
    move |source| StoreError::Io { context, source }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub content_hash: String,
    pub byte_size: usize,
    /// Identical bytes were already stored under this key.
    pub deduplicated: bool,
}

/// Opaque put/get-by-key store for attachment bytes.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<StoredObject, StoreError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Filesystem store: one file per key, written atomically via temp-file rename.
#[derive(Debug, Clone)]
pub struct FsKeyValueStore {
    root: PathBuf,
}

impl FsKeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.root.clone();
        for part in key.split('/') {
            if part.is_empty() || part == "." || part == ".." || part.contains('\\') {
                return Err(StoreError::InvalidKey(key.to_string()));
            }
            path.push(part);
        }
        Ok(path)
    }
}

#[async_trait]
impl KeyValueStore for FsKeyValueStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<StoredObject, StoreError> {
        let path = self.path_for(key)?;
        let content_hash = sha256_hex(bytes);
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;

        fs::create_dir_all(parent)
            .await
            .map_err(io_error(format!("creating store directory {}", parent.display())))?;

        let exists = fs::try_exists(&path)
            .await
            .map_err(io_error(format!("checking store path {}", path.display())))?;
        if exists {
            let current = fs::read(&path)
                .await
                .map_err(io_error(format!("reading stored object {}", path.display())))?;
            if sha256_hex(&current) == content_hash {
                return Ok(StoredObject {
                    key: key.to_string(),
                    content_hash,
                    byte_size: bytes.len(),
                    deduplicated: true,
                });
            }
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let write = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .map_err(io_error(format!("opening temp file {}", temp_path.display())))?;
            file.write_all(bytes)
                .await
                .map_err(io_error(format!("writing temp file {}", temp_path.display())))?;
            file.flush()
                .await
                .map_err(io_error(format!("flushing temp file {}", temp_path.display())))?;
            drop(file);
            fs::rename(&temp_path, &path).await.map_err(io_error(format!(
                "renaming {} -> {}",
                temp_path.display(),
                path.display()
            )))
        };

        if let Err(err) = write.await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        Ok(StoredObject {
            key: key.to_string(),
            content_hash,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(format!("reading stored object {}", path.display()))(err)),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicU64,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys = self.objects.lock().await.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Number of puts that changed stored bytes.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<StoredObject, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let mut objects = self.objects.lock().await;
        let deduplicated = objects.get(key).is_some_and(|current| current == bytes);
        if !deduplicated {
            objects.insert(key.to_string(), bytes.to_vec());
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(StoredObject {
            key: key.to_string(),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
            deduplicated,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.objects.lock().await.get(key).cloned())
    }
}

/// Export collaborator receiving each assembled record.
#[async_trait]
pub trait DatasetSink: Send + Sync {
    async fn append(&self, record: &Opportunity) -> Result<(), StoreError>;
}

/// JSON Lines dataset, truncated when opened since every run stands alone.
#[derive(Debug)]
pub struct JsonlDataset {
    path: PathBuf,
    file: Mutex<fs::File>,
}

impl JsonlDataset {
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(io_error(format!("creating dataset directory {}", parent.display())))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(io_error(format!("opening dataset {}", path.display())))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DatasetSink for JsonlDataset {
    async fn append(&self, record: &Opportunity) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(io_error(format!("appending to dataset {}", self.path.display())))?;
        file.flush()
            .await
            .map_err(io_error(format!("flushing dataset {}", self.path.display())))
    }
}

#[derive(Debug, Default)]
pub struct MemoryDataset {
    records: Mutex<Vec<Opportunity>>,
}

impl MemoryDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<Opportunity> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl DatasetSink for MemoryDataset {
    async fn append(&self, record: &Opportunity) -> Result<(), StoreError> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}
