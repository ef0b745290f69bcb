//! Seen-tweet persistence + HTTP fetch utilities for kwatch.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use kwatch_core::SeenTweet;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "kwatch-storage";

const SEEN_TWEETS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS seen_tweets (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    tweet_id    TEXT NOT NULL UNIQUE,
    text        TEXT NOT NULL,
    parsed_text TEXT NOT NULL UNIQUE
)"#;

// Tables created before `parsed_text` carried a UNIQUE constraint get it here.
const SEEN_TWEETS_TEXT_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS seen_tweets_parsed_text ON seen_tweets(parsed_text)";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("initializing seen-tweet store {target}: {source}")]
    Init {
        target: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("querying seen-tweet store: {0}")]
    Query(#[source] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Append-only log of processed tweets, keyed by tweet id and canonical text.
///
/// Reads and writes go through a [`StoreSession`], which holds the store's
/// lock for its whole lifetime. Two callers sharing one store can therefore
/// never both observe "not seen" for the same tweet and both insert it.
#[derive(Debug)]
pub struct SeenTweetStore {
    pool: SqlitePool,
    target: String,
    lock: Mutex<()>,
}

impl SeenTweetStore {
    /// Connect to a `sqlite://` URL, creating the database file if missing.
    pub async fn connect(url: &str, config: StoreConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url).map_err(|source| StoreError::Init {
            target: url.to_string(),
            source,
        })?;
        Self::connect_with(options, url.to_string(), config).await
    }

    pub async fn connect_path(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new().filename(path);
        Self::connect_with(options, path.display().to_string(), config).await
    }

    async fn connect_with(
        options: SqliteConnectOptions,
        target: String,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|source| StoreError::Init {
                target: target.clone(),
                source,
            })?;
        Ok(Self {
            pool,
            target,
            lock: Mutex::new(()),
        })
    }

    /// Connect and make sure the schema exists.
    pub async fn open(url: &str, config: StoreConfig) -> Result<Self, StoreError> {
        let store = Self::connect(url, config).await?;
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn open_path(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let store = Self::connect_path(path, config).await?;
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Idempotent; safe to call on every startup.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in [SEEN_TWEETS_SCHEMA, SEEN_TWEETS_TEXT_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|source| StoreError::Init {
                    target: self.target.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Acquire the store lock. Held until the returned session is dropped.
    pub async fn lock(&self) -> StoreSession<'_> {
        StoreSession {
            pool: &self.pool,
            _guard: self.lock.lock().await,
        }
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM seen_tweets")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Query)
    }

    pub async fn find_by_tweet_id(&self, tweet_id: &str) -> Result<Option<SeenTweet>, StoreError> {
        let row = sqlx::query_as::<_, (i64, String, String, String)>(
            "SELECT id, tweet_id, text, parsed_text FROM seen_tweets WHERE tweet_id = ?1",
        )
        .bind(tweet_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)?;
        Ok(row.map(|(id, tweet_id, text, parsed_text)| SeenTweet {
            id,
            tweet_id,
            text,
            parsed_text,
        }))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Exclusive read-then-write access to a [`SeenTweetStore`].
pub struct StoreSession<'a> {
    pool: &'a SqlitePool,
    _guard: MutexGuard<'a, ()>,
}

impl StoreSession<'_> {
    /// True when a record matches the tweet id or the canonical text.
    pub async fn exists(&self, tweet_id: &str, parsed_text: &str) -> Result<bool, StoreError> {
        let matches = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM seen_tweets WHERE tweet_id = ?1 OR parsed_text = ?2",
        )
        .bind(tweet_id)
        .bind(parsed_text)
        .fetch_one(self.pool)
        .await
        .map_err(StoreError::Query)?;
        Ok(matches > 0)
    }

    /// Insert a record. Returns `false` when the write is rejected, including
    /// the expected case of a uniqueness conflict with an existing record.
    pub async fn record(&self, tweet_id: &str, text: &str, parsed_text: &str) -> bool {
        let result = sqlx::query(
            "INSERT INTO seen_tweets (tweet_id, text, parsed_text) VALUES (?1, ?2, ?3)",
        )
        .bind(tweet_id)
        .bind(text)
        .bind(parsed_text)
        .execute(self.pool)
        .await;

        match result {
            Ok(_) => true,
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                debug!(tweet_id, "seen tweet already recorded");
                false
            }
            Err(err) => {
                warn!(tweet_id, error = %err, "failed to record seen tweet");
                false
            }
        }
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
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
}

/// Shared HTTP client used by the search and notification collaborators.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
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
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    /// GET with query parameters, retrying transient failures with backoff.
    pub async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
        bearer_token: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.global_limit.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", method = "GET", url);
        self.get_with_retries(url, query, bearer_token)
            .instrument(span)
            .await
    }

    async fn get_with_retries(
        &self,
        url: &str,
        query: &[(&str, String)],
        bearer_token: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url).query(query);
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return read_response(resp).await;
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retrying http request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(status_error(resp).await);
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying http request");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    /// POST a JSON body once. Notifications are best-effort and never retried.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        bearer_token: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.global_limit.acquire().await.expect("semaphore not closed");

        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }

        let span = info_span!("http_fetch", method = "POST", url);
        send_once(request).instrument(span).await
    }
}

async fn send_once(request: reqwest::RequestBuilder) -> Result<FetchedResponse, FetchError> {
    let resp = request.send().await?;
    if resp.status().is_success() {
        read_response(resp).await
    } else {
        Err(status_error(resp).await)
    }
}

async fn read_response(resp: reqwest::Response) -> Result<FetchedResponse, FetchError> {
    let status = resp.status();
    let final_url = resp.url().to_string();
    let body = resp.bytes().await?.to_vec();
    Ok(FetchedResponse {
        status,
        final_url,
        body,
    })
}

async fn status_error(resp: reqwest::Response) -> FetchError {
    let status = resp.status().as_u16();
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    FetchError::HttpStatus { status, url, body }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn temp_store(dir: &tempfile::TempDir) -> SeenTweetStore {
        SeenTweetStore::open_path(dir.path().join("seen.db"), StoreConfig::default())
            .await
            .expect("open store")
    }

    #[tokio::test]
    async fn schema_creation_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = temp_store(&dir).await;
        store.ensure_schema().await.expect("second ensure");
        store.ensure_schema().await.expect("third ensure");
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn legacy_table_gains_unique_canonical_text() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tb.db");
        let legacy = SeenTweetStore::connect_path(&path, StoreConfig::default())
            .await
            .expect("connect");
        sqlx::query(
            "CREATE TABLE seen_tweets (id INTEGER PRIMARY KEY AUTOINCREMENT, \
             tweet_id TEXT NOT NULL UNIQUE, text TEXT NOT NULL, parsed_text TEXT NOT NULL)",
        )
        .execute(&legacy.pool)
        .await
        .expect("legacy table");
        legacy.close().await;

        let store = SeenTweetStore::open_path(&path, StoreConfig::default())
            .await
            .expect("open upgraded store");
        let session = store.lock().await;
        assert!(session.record("1", "Big breach", "Bigbreach").await);
        assert!(!session.record("2", "Big  breach", "Bigbreach").await);
        drop(session);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn exists_matches_on_id_or_canonical_text() {
        let dir = tempdir().expect("tempdir");
        let store = temp_store(&dir).await;
        let session = store.lock().await;

        assert!(!session.exists("1", "Bigbreach").await.unwrap());
        assert!(session.record("1", "Big breach", "Bigbreach").await);

        assert!(session.exists("1", "somethingelse").await.unwrap());
        assert!(session.exists("2", "Bigbreach").await.unwrap());
        assert!(!session.exists("2", "somethingelse").await.unwrap());
    }

    #[tokio::test]
    async fn exists_is_true_when_id_and_text_hit_different_rows() {
        let dir = tempdir().expect("tempdir");
        let store = temp_store(&dir).await;
        let session = store.lock().await;
        assert!(session.record("1", "a", "a").await);
        assert!(session.record("2", "b", "b").await);
        assert!(session.exists("1", "b").await.unwrap());
    }

    #[tokio::test]
    async fn record_returns_false_on_uniqueness_conflicts() {
        let dir = tempdir().expect("tempdir");
        let store = temp_store(&dir).await;
        let session = store.lock().await;

        assert!(session.record("1", "Big breach", "Bigbreach").await);
        assert!(!session.record("1", "changed text", "changedtext").await);
        assert!(!session.record("2", "Big  breach", "Bigbreach").await);
        drop(session);

        assert_eq!(store.count().await.unwrap(), 1);
        let seen = store.find_by_tweet_id("1").await.unwrap().expect("record");
        assert_eq!(seen.text, "Big breach");
        assert_eq!(seen.parsed_text, "Bigbreach");
    }

    #[tokio::test]
    async fn records_survive_reopening_the_database() {
        let dir = tempdir().expect("tempdir");
        {
            let store = temp_store(&dir).await;
            assert!(store.lock().await.record("42", "hello", "hello").await);
            store.close().await;
        }
        let reopened = temp_store(&dir).await;
        assert!(reopened.lock().await.exists("42", "").await.unwrap());
        assert_eq!(reopened.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn separate_instances_break_ties_through_constraints() {
        let dir = tempdir().expect("tempdir");
        let first = temp_store(&dir).await;
        let second = temp_store(&dir).await;

        assert!(first.lock().await.record("1", "x y", "xy").await);
        assert!(!second.lock().await.record("9", "xy", "xy").await);
        assert_eq!(second.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unopenable_database_is_an_init_error() {
        let dir = tempdir().expect("tempdir");
        let missing_parent = dir.path().join("no-such-dir").join("seen.db");
        let err = SeenTweetStore::open_path(&missing_parent, StoreConfig::default())
            .await
            .expect_err("should fail");
        assert!(matches!(err, StoreError::Init { .. }));
    }

    #[tokio::test]
    async fn session_lock_is_exclusive() {
        let dir = tempdir().expect("tempdir");
        let store = temp_store(&dir).await;
        let held = store.lock().await;
        let waiting = tokio::time::timeout(Duration::from_millis(50), store.lock()).await;
        assert!(waiting.is_err());
        drop(held);
        let acquired = tokio::time::timeout(Duration::from_millis(500), store.lock()).await;
        assert!(acquired.is_ok());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn token_bucket_hands_out_initial_capacity_without_waiting() {
        let bucket = SimpleTokenBucket::new(3, Duration::from_secs(60));
        let taken = tokio::time::timeout(Duration::from_millis(200), async {
            for _ in 0..3 {
                bucket.take().await;
            }
        })
        .await;
        assert!(taken.is_ok());
    }

    #[test]
    fn fetched_response_decodes_json_body() {
        let resp = FetchedResponse {
            status: StatusCode::OK,
            final_url: "https://example.test".into(),
            body: br#"{"ok":true}"#.to_vec(),
        };
        let value: serde_json::Value = resp.json().unwrap();
        assert_eq!(value["ok"], true);
    }
}
