//! Core domain model and tweet text canonicalization for kwatch.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "kwatch-core";

/// Base path that a tweet id is appended to when building its public URL.
pub const TWEET_URL_BASE: &str = "https://twitter.com/i/web/status";

/// Smallest page the recent-search endpoint accepts.
pub const PAGE_SIZE_MIN: u32 = 10;
/// Largest page the recent-search endpoint accepts.
pub const PAGE_SIZE_MAX: u32 = 100;

pub fn page_size_in_bounds(page_size: u32) -> bool {
    (PAGE_SIZE_MIN..=PAGE_SIZE_MAX).contains(&page_size)
}

/// A search hit as returned by the fetch collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tweet {
    pub id: String,
    pub text: String,
}

impl Tweet {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// A tweet that was seen for the first time and now has a durable record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTweet {
    pub text: String,
    pub url: String,
}

impl NewTweet {
    pub fn from_tweet(tweet: &Tweet, url_base: &str) -> Self {
        Self {
            text: tweet.text.clone(),
            url: tweet_url(url_base, &tweet.id),
        }
    }

    /// Chat message body delivered to the notifier.
    pub fn notification_text(&self) -> String {
        format!("{}\n\n{}", self.text, self.url)
    }
}

pub fn tweet_url(url_base: &str, tweet_id: &str) -> String {
    format!("{}/{}", url_base.trim_end_matches('/'), tweet_id)
}

/// Persistent record of a processed tweet. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenTweet {
    pub id: i64,
    pub tweet_id: String,
    pub text: String,
    pub parsed_text: String,
}

/// New tweets grouped by the keyword whose search surfaced them.
///
/// Keys keep the order the keywords were polled in. Keywords with no new
/// tweets are absent, never mapped to an empty list.
pub type KeywordMatches = IndexMap<String, Vec<NewTweet>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizationMode {
    /// Strip platform short links only.
    Basic,
    /// Also strip hashtags, mentions, escaped code points and all whitespace.
    #[default]
    Aggressive,
}

impl NormalizationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizationMode::Basic => "basic",
            NormalizationMode::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for NormalizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown normalization mode {0:?} (expected \"basic\" or \"aggressive\")")]
pub struct ParseModeError(String);

impl FromStr for NormalizationMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(NormalizationMode::Basic),
            "aggressive" => Ok(NormalizationMode::Aggressive),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

static SHORT_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://t\.co/\S+").expect("valid regex"));
static HASHTAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#\w+").expect("valid regex"));
static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@\w+").expect("valid regex"));
static ESCAPED_CODEPOINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\u\d+\b").expect("valid regex"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s").expect("valid regex"));

/// Reduces raw tweet text to the key used for content-level dedup.
///
/// Short links are rewritten per post by the platform, so two reposts of the
/// same content differ byte-for-byte. Canonical text removes that noise.
///
/// ```
/// use kwatch_core::{NormalizationMode, TweetNormalizer};
///
/// let normalizer = TweetNormalizer::new(NormalizationMode::Aggressive);
/// assert_eq!(
///     normalizer.normalize("Big breach #magecart http://t.co/abc123"),
///     "Bigbreach"
/// );
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TweetNormalizer {
    mode: NormalizationMode,
}

impl TweetNormalizer {
    pub fn new(mode: NormalizationMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> NormalizationMode {
        self.mode
    }

    /// Total and deterministic. The pass is repeated until it reaches a fixed
    /// point, so `normalize(normalize(x)) == normalize(x)` holds even when a
    /// removal joins two fragments into a new token.
    pub fn normalize(&self, raw: &str) -> String {
        let mut current = self.single_pass(raw);
        loop {
            let next = self.single_pass(&current);
            if next == current {
                return current;
            }
            current = next;
        }
    }

    fn single_pass(&self, raw: &str) -> String {
        let text = strip(&SHORT_LINK_RE, raw);
        match self.mode {
            NormalizationMode::Basic => text,
            NormalizationMode::Aggressive => {
                let text = strip(&HASHTAG_RE, &text);
                let text = strip(&MENTION_RE, &text);
                let text = strip(&ESCAPED_CODEPOINT_RE, &text);
                strip(&WHITESPACE_RE, &text)
            }
        }
    }
}

fn strip(pattern: &Regex, text: &str) -> String {
    pattern.replace_all(text, "").trim().to_string()
}
