use std::path::{Path, PathBuf};
use std::sync::Arc;

use kwatch_adapters::FixtureSearchSource;
use kwatch_core::{NewTweet, NormalizationMode, TweetNormalizer};
use kwatch_storage::{SeenTweetStore, StoreConfig};
use kwatch_sync::{DedupConfig, DedupEngine, KeywordPoller, PollError};

fn sample_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/twitter-recent-search/sample")
}

async fn poller_with_store(dir: &tempfile::TempDir) -> (KeywordPoller, Arc<SeenTweetStore>) {
    let store = Arc::new(
        SeenTweetStore::open_path(dir.path().join("tb.db"), StoreConfig::default())
            .await
            .expect("open store"),
    );
    let dedup = DedupEngine::new(store.clone(), DedupConfig::default());
    let source = Arc::new(FixtureSearchSource::from_dir(sample_dir()));
    (KeywordPoller::new(source, dedup), store)
}

#[tokio::test]
async fn sample_page_with_two_seen_tweets_yields_one_new() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (poller, store) = poller_with_store(&dir).await;
    let normalizer = TweetNormalizer::new(NormalizationMode::Aggressive);
    {
        let session = store.lock().await;
        // Seen by id on an earlier run.
        assert!(session.record("1712345678901234567", "Big breach #magecart http://t.co/old", "Bigbreach").await);
        // Seen by content under a different id.
        let repost = "@someone Magecart group 12 is back with a fresh loader https://t.co/other";
        assert!(session.record("1600000000000000000", repost, &normalizer.normalize(repost)).await);
    }

    let matches = poller
        .poll(&["magecart".to_string()], 30)
        .await
        .expect("poll");

    assert_eq!(matches.len(), 1);
    assert_eq!(
        matches["magecart"],
        vec![NewTweet {
            text: "New skimmer injected into checkout pages of a large retailer https://t.co/Zx81kLm0Qa".into(),
            url: "https://twitter.com/i/web/status/1712345678901234568".into(),
        }]
    );
    assert_eq!(store.count().await.unwrap(), 3);
}

#[tokio::test]
async fn nothing_new_is_an_empty_mapping() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (poller, _store) = poller_with_store(&dir).await;

    let first = poller.poll(&["magecart".to_string()], 30).await.expect("poll");
    assert_eq!(first["magecart"].len(), 3);

    let keywords = vec!["magecart".to_string(), "no results".to_string()];
    let second = poller.poll(&keywords, 30).await.expect("poll");
    assert!(second.is_empty());
    assert_eq!(serde_json::to_value(&second).unwrap(), serde_json::json!({}));
}

#[tokio::test]
async fn undersized_page_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (poller, store) = poller_with_store(&dir).await;

    let err = poller.poll(&["magecart".to_string()], 5).await.unwrap_err();
    assert!(matches!(err, PollError::Validation { page_size: 5 }));
    assert_eq!(store.count().await.unwrap(), 0);
}
