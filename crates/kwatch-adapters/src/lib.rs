//! Search + notification collaborators: recent-search adapters and chat notifiers.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kwatch_core::Tweet;
use kwatch_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::info;

pub const CRATE_NAME: &str = "kwatch-adapters";

pub const TWITTER_RECENT_SEARCH_URL: &str = "https://api.twitter.com/2/tweets/search/recent";
pub const SLACK_POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub phrase: String,
    pub max_results: u32,
    pub include_retweets: bool,
}

impl SearchQuery {
    pub fn new(phrase: impl Into<String>, max_results: u32) -> Self {
        Self {
            phrase: phrase.into(),
            max_results,
            include_retweets: false,
        }
    }

    pub fn with_retweets(mut self, include_retweets: bool) -> Self {
        self.include_retweets = include_retweets;
        self
    }

    /// Search expression sent upstream.
    pub fn query_string(&self) -> String {
        if self.include_retweets {
            self.phrase.clone()
        } else {
            format!("{} -is:retweet", self.phrase)
        }
    }
}

/// One bounded batch of results for a single query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPage {
    pub tweets: Vec<Tweet>,
    pub newest_id: Option<String>,
    pub result_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RecentSearchResponse {
    #[serde(default)]
    data: Vec<Tweet>,
    #[serde(default)]
    meta: Option<RecentSearchMeta>,
}

#[derive(Debug, Deserialize)]
struct RecentSearchMeta {
    newest_id: Option<String>,
    result_count: Option<u32>,
}

/// Decode a recent-search response body. A body without `data` is an empty page.
pub fn parse_recent_search(body: &[u8]) -> Result<SearchPage, AdapterError> {
    let response: RecentSearchResponse = serde_json::from_slice(body)?;
    let (newest_id, result_count) = match response.meta {
        Some(meta) => (meta.newest_id, meta.result_count),
        None => (None, None),
    };
    Ok(SearchPage {
        tweets: response.data,
        newest_id,
        result_count,
    })
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding search response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait SearchSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, AdapterError>;
}

/// Twitter API v2 recent search, authenticated with an app bearer token.
#[derive(Debug)]
pub struct TwitterRecentSearch {
    http: Arc<HttpFetcher>,
    bearer_token: String,
    endpoint: String,
}

impl TwitterRecentSearch {
    pub fn new(http: Arc<HttpFetcher>, bearer_token: impl Into<String>) -> Self {
        Self {
            http,
            bearer_token: bearer_token.into(),
            endpoint: TWITTER_RECENT_SEARCH_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn query_params(query: &SearchQuery) -> Vec<(&'static str, String)> {
        vec![
            ("query", query.query_string()),
            ("max_results", query.max_results.to_string()),
        ]
    }
}

#[async_trait]
impl SearchSource for TwitterRecentSearch {
    fn source_id(&self) -> &'static str {
        "twitter-recent-search"
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, AdapterError> {
        let params = Self::query_params(query);
        let response = self
            .http
            .get(&self.endpoint, &params, Some(self.bearer_token.as_str()))
            .await?;
        parse_recent_search(&response.body)
    }
}

/// Offline source that replays saved recent-search responses from a directory,
/// one `<keyword-slug>.json` file per keyword.
#[derive(Debug, Clone)]
pub struct FixtureSearchSource {
    dir: PathBuf,
}

impl FixtureSearchSource {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn fixture_path(&self, phrase: &str) -> PathBuf {
        self.dir.join(format!("{}.json", keyword_slug(phrase)))
    }
}

#[async_trait]
impl SearchSource for FixtureSearchSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, AdapterError> {
        let path = self.fixture_path(&query.phrase);
        let mut page = match load_fixture_page(&path).await {
            Ok(page) => page,
            Err(AdapterError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                SearchPage::default()
            }
            Err(err) => return Err(err),
        };
        page.tweets.truncate(query.max_results as usize);
        Ok(page)
    }
}

pub async fn load_fixture_page(path: impl AsRef<Path>) -> Result<SearchPage, AdapterError> {
    let path = path.as_ref();
    let bytes = fs::read(path).await.map_err(|source| AdapterError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_recent_search(&bytes)
}

/// File-name-safe form of a search keyword.
pub fn keyword_slug(input: &str) -> String {
    let mut out = String::new();
    let mut prev_dash = false;
    for ch in input.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            prev_dash = false;
        } else if !prev_dash {
            out.push('-');
            prev_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("chat api rejected message: {0}")]
    Api(String),
    #[error("decoding chat api response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn post_message(&self, text: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Serialize)]
struct SlackMessage<'a> {
    channel: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Slack answers 200 even for rejected messages; the verdict is in `ok`.
pub fn check_slack_response(body: &[u8]) -> Result<(), NotifyError> {
    let response: SlackResponse = serde_json::from_slice(body)?;
    if response.ok {
        Ok(())
    } else {
        Err(NotifyError::Api(
            response.error.unwrap_or_else(|| "unknown error".to_string()),
        ))
    }
}

#[derive(Debug)]
pub struct SlackNotifier {
    http: Arc<HttpFetcher>,
    token: String,
    channel_id: String,
    endpoint: String,
}

impl SlackNotifier {
    pub fn new(http: Arc<HttpFetcher>, token: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
            channel_id: channel_id.into(),
            endpoint: SLACK_POST_MESSAGE_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn post_message(&self, text: &str) -> Result<(), NotifyError> {
        let message = SlackMessage {
            channel: &self.channel_id,
            text,
        };
        let response = self
            .http
            .post_json(&self.endpoint, &message, Some(self.token.as_str()))
            .await?;
        check_slack_response(&response.body)
    }
}

/// Writes messages to the log instead of a chat channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn post_message(&self, text: &str) -> Result<(), NotifyError> {
        info!(message = text, "notification");
        Ok(())
    }
}
