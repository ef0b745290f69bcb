//! Keyword polling, tweet dedup and run orchestration for kwatch.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kwatch_adapters::{
    AdapterError, FixtureSearchSource, LogNotifier, Notifier, SearchQuery, SearchSource,
    SlackNotifier, TwitterRecentSearch,
};
use kwatch_core::{
    page_size_in_bounds, KeywordMatches, NewTweet, NormalizationMode, Tweet, TweetNormalizer,
    PAGE_SIZE_MAX, PAGE_SIZE_MIN, TWEET_URL_BASE,
};
use kwatch_storage::{
    HttpClientConfig, HttpFetcher, SeenTweetStore, StoreConfig, StoreError, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kwatch-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub twitter_bearer_token: Option<String>,
    pub slack_token: Option<String>,
    pub slack_channel_id: Option<String>,
    pub page_size: u32,
    pub normalization: NormalizationMode,
    pub include_retweets: bool,
    pub notify: bool,
    pub scheduler_enabled: bool,
    pub poll_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub reports_dir: Option<PathBuf>,
    pub fixtures_dir: Option<PathBuf>,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup; missing or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let flag = |key: &str| {
            lookup(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false)
        };

        Self {
            database_url: non_empty("KWATCH_DATABASE_URL")
                .unwrap_or_else(|| "sqlite://tb.db".to_string()),
            twitter_bearer_token: non_empty("TWITTER_BEARER_TOKEN"),
            slack_token: non_empty("SLACK_TOKEN"),
            slack_channel_id: non_empty("SLACK_CHANNEL_ID"),
            page_size: parse_setting("KWATCH_PAGE_SIZE", non_empty("KWATCH_PAGE_SIZE"), 30),
            normalization: parse_setting(
                "KWATCH_NORMALIZATION",
                non_empty("KWATCH_NORMALIZATION"),
                NormalizationMode::default(),
            ),
            include_retweets: flag("KWATCH_INCLUDE_RETWEETS"),
            notify: true,
            scheduler_enabled: flag("KWATCH_SCHEDULER_ENABLED"),
            poll_cron: non_empty("KWATCH_POLL_CRON")
                .unwrap_or_else(|| "0 */15 * * * *".to_string()),
            user_agent: non_empty("KWATCH_USER_AGENT")
                .unwrap_or_else(|| "kwatch-bot/0.1".to_string()),
            http_timeout_secs: parse_setting(
                "KWATCH_HTTP_TIMEOUT_SECS",
                non_empty("KWATCH_HTTP_TIMEOUT_SECS"),
                20,
            ),
            reports_dir: non_empty("KWATCH_REPORTS_DIR").map(PathBuf::from),
            fixtures_dir: None,
            workspace_root: non_empty("KWATCH_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn keywords_path(&self) -> PathBuf {
        self.workspace_root.join("keywords.yaml")
    }

    pub fn log_redacted(&self) {
        info!(
            database_url = self.database_url.as_str(),
            twitter_token = self.twitter_bearer_token.is_some(),
            slack = self.slack_token.is_some() && self.slack_channel_id.is_some(),
            page_size = self.page_size,
            normalization = %self.normalization,
            scheduler = self.scheduler_enabled,
            "loaded config"
        );
    }
}

fn parse_setting<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + fmt::Display,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = raw.as_str(), default = %default, "unparsable setting, using default");
            default
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeywordFile {
    #[serde(default)]
    pub keywords: Vec<String>,
}

pub async fn load_keywords(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: KeywordFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file
        .keywords
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect())
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error(
        "page size must be between {min} and {max}, got {page_size}",
        min = PAGE_SIZE_MIN,
        max = PAGE_SIZE_MAX
    )]
    Validation { page_size: u32 },
    #[error("search for {keyword:?} failed: {source}")]
    Fetch {
        keyword: String,
        #[source]
        source: AdapterError,
    },
    #[error("dedup lookup for {keyword:?} failed: {source}")]
    StoreQuery {
        keyword: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub mode: NormalizationMode,
    pub tweet_url_base: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            mode: NormalizationMode::default(),
            tweet_url_base: TWEET_URL_BASE.to_string(),
        }
    }
}

/// Classifies fetched tweets as new or already seen, recording new ones.
///
/// The store lock is held from the existence check through the insert, so
/// each distinct tweet is reported at most once per store.
pub struct DedupEngine {
    store: Arc<SeenTweetStore>,
    normalizer: TweetNormalizer,
    tweet_url_base: String,
}

impl DedupEngine {
    pub fn new(store: Arc<SeenTweetStore>, config: DedupConfig) -> Self {
        Self {
            store,
            normalizer: TweetNormalizer::new(config.mode),
            tweet_url_base: config.tweet_url_base,
        }
    }

    /// `Ok(None)` covers both "seen before" and "lost the insert"; only a
    /// failed existence check is an error.
    pub async fn classify_and_record(&self, tweet: &Tweet) -> Result<Option<NewTweet>, StoreError> {
        let canonical = self.normalizer.normalize(&tweet.text);
        let session = self.store.lock().await;

        if session.exists(&tweet.id, &canonical).await? {
            return Ok(None);
        }

        if !session.record(&tweet.id, &tweet.text, &canonical).await {
            return Ok(None);
        }

        Ok(Some(NewTweet::from_tweet(tweet, &self.tweet_url_base)))
    }
}

/// Runs each keyword search through the dedup engine.
pub struct KeywordPoller {
    source: Arc<dyn SearchSource>,
    dedup: DedupEngine,
    include_retweets: bool,
}

impl KeywordPoller {
    pub fn new(source: Arc<dyn SearchSource>, dedup: DedupEngine) -> Self {
        Self {
            source,
            dedup,
            include_retweets: false,
        }
    }

    pub fn with_retweets(mut self, include_retweets: bool) -> Self {
        self.include_retweets = include_retweets;
        self
    }

    /// All-or-nothing: the first fetch or store failure aborts the whole poll.
    pub async fn poll(&self, keywords: &[String], page_size: u32) -> Result<KeywordMatches, PollError> {
        if !page_size_in_bounds(page_size) {
            return Err(PollError::Validation { page_size });
        }

        let mut matches = KeywordMatches::new();
        for keyword in keywords {
            let span = info_span!("poll_keyword", keyword = keyword.as_str(), page_size);
            let new_tweets = self.poll_keyword(keyword, page_size).instrument(span).await?;
            if !new_tweets.is_empty() {
                matches.entry(keyword.clone()).or_default().extend(new_tweets);
            }
        }
        Ok(matches)
    }

    async fn poll_keyword(&self, keyword: &str, page_size: u32) -> Result<Vec<NewTweet>, PollError> {
        let query = SearchQuery::new(keyword, page_size).with_retweets(self.include_retweets);
        let page = self
            .source
            .search(&query)
            .await
            .map_err(|source| PollError::Fetch {
                keyword: keyword.to_string(),
                source,
            })?;

        let fetched = page.tweets.len();
        let mut new_tweets = Vec::new();
        for tweet in &page.tweets {
            let classified = self
                .dedup
                .classify_and_record(tweet)
                .await
                .map_err(|source| PollError::StoreQuery {
                    keyword: keyword.to_string(),
                    source,
                })?;
            if let Some(new_tweet) = classified {
                new_tweets.push(new_tweet);
            }
        }

        debug!(fetched, new = new_tweets.len(), "keyword polled");
        Ok(new_tweets)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Published,
    NothingNew,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub keywords: usize,
    pub new_tweets: usize,
    pub notified: usize,
    pub notify_failures: usize,
    pub status: RunStatus,
    pub report_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub matches: KeywordMatches,
}

#[derive(Debug, Serialize)]
struct RunReport<'a> {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    keywords: &'a [String],
    page_size: u32,
    matches: &'a KeywordMatches,
}

/// Operator line printed after each run.
pub fn format_run_line(summary: &RunSummary) -> String {
    let stamp = summary.finished_at.format("%Y-%m-%d %H:%M:%S");
    match summary.status {
        RunStatus::Published => {
            let noun = if summary.new_tweets == 1 { "tweet" } else { "tweets" };
            format!("[{stamp}] Published {} {noun}", summary.new_tweets)
        }
        RunStatus::NothingNew => format!("[{stamp}] Nothing new..."),
    }
}

/// One poll-notify-report cycle over a shared store.
pub struct PollPipeline {
    config: SyncConfig,
    poller: KeywordPoller,
    notifier: Box<dyn Notifier>,
}

impl PollPipeline {
    pub fn new(config: SyncConfig, poller: KeywordPoller, notifier: Box<dyn Notifier>) -> Self {
        Self {
            config,
            poller,
            notifier,
        }
    }

    /// Wire the store, HTTP client, search source and notifier described by `config`.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = SeenTweetStore::open(&config.database_url, StoreConfig::default())
            .await
            .context("opening seen-tweet store")?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            token_bucket: Some(TokenBucketConfig {
                capacity: 30,
                refill_every: Duration::from_secs(2),
            }),
            ..Default::default()
        })?);

        let source: Arc<dyn SearchSource> = match &config.fixtures_dir {
            Some(dir) => Arc::new(FixtureSearchSource::from_dir(dir.clone())),
            None => {
                let token = config.twitter_bearer_token.clone().context(
                    "TWITTER_BEARER_TOKEN is required unless a fixtures directory is given",
                )?;
                Arc::new(TwitterRecentSearch::new(http.clone(), token))
            }
        };

        let notifier: Box<dyn Notifier> = match (&config.slack_token, &config.slack_channel_id) {
            (Some(token), Some(channel)) if config.notify => {
                Box::new(SlackNotifier::new(http.clone(), token.clone(), channel.clone()))
            }
            _ => Box::new(LogNotifier),
        };

        let dedup = DedupEngine::new(
            Arc::new(store),
            DedupConfig {
                mode: config.normalization,
                ..Default::default()
            },
        );
        let poller = KeywordPoller::new(source, dedup).with_retweets(config.include_retweets);
        info!(
            source = poller.source.source_id(),
            notifier = notifier.name(),
            "pipeline ready"
        );
        Ok(Self::new(config, poller, notifier))
    }

    pub async fn run_once(&self, keywords: &[String]) -> Result<RunOutcome> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let page_size = self.config.page_size;

        let matches = self
            .poller
            .poll(keywords, page_size)
            .instrument(info_span!("poll_run", %run_id))
            .await?;

        let mut new_tweets = 0usize;
        let mut notified = 0usize;
        let mut notify_failures = 0usize;
        for (keyword, tweets) in &matches {
            for tweet in tweets {
                new_tweets += 1;
                match self.notifier.post_message(&tweet.notification_text()).await {
                    Ok(()) => notified += 1,
                    Err(err) => {
                        notify_failures += 1;
                        warn!(%run_id, keyword = keyword.as_str(), url = tweet.url.as_str(), error = %err, "notification failed");
                    }
                }
            }
        }

        let finished_at = Utc::now();
        let report_path = match &self.config.reports_dir {
            Some(dir) => {
                let report = RunReport {
                    run_id,
                    started_at,
                    finished_at,
                    keywords,
                    page_size,
                    matches: &matches,
                };
                match write_report(dir, &report).await {
                    Ok(path) => Some(path.display().to_string()),
                    Err(err) => {
                        warn!(%run_id, error = %format!("{err:#}"), "run report not written");
                        None
                    }
                }
            }
            None => None,
        };

        let status = if new_tweets > 0 {
            RunStatus::Published
        } else {
            RunStatus::NothingNew
        };

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            keywords: keywords.len(),
            new_tweets,
            notified,
            notify_failures,
            status,
            report_path,
        };
        info!(%run_id, new_tweets, notified, notify_failures, "poll run complete");
        Ok(RunOutcome { summary, matches })
    }

    /// Run against the keywords file, re-read on every call.
    pub async fn run_configured(&self) -> Result<RunOutcome> {
        let keywords = load_keywords(self.config.keywords_path()).await?;
        self.run_once(&keywords).await
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.poll_cron.as_str();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_configured().await {
                    Ok(outcome) => info!("{}", format_run_line(&outcome.summary)),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled poll failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

async fn write_report(reports_dir: &Path, report: &RunReport<'_>) -> Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join("new_tweets.json");
    let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Start the scheduler and block until Ctrl-C.
pub async fn serve_scheduler(pipeline: Arc<PollPipeline>) -> Result<()> {
    let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
        anyhow::bail!("scheduler disabled; set KWATCH_SCHEDULER_ENABLED=true");
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = pipeline.config.poll_cron.as_str(), "scheduler running");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
