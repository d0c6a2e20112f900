use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use super::ids::FeedId;
use super::record::FeedRecord;
use super::{track, Article, ModelError};
use crate::storage::{Collection, CollectionError};

/// Number of refreshes to sit out after `offenses` consecutive failed updates.
///
/// Fibonacci-shaped: 0, 1 and 2 offenses are free, after that the wait is
/// `fib(offenses - 2)`, giving `0, 0, 0, 1, 1, 2, 3, 5, 8, 13, ...`.
pub fn wait_period_in_refreshes(offenses: u32) -> u32 {
    if offenses < 3 {
        return 0;
    }
    let (mut prev, mut current) = (0u32, 1u32);
    for _ in 1..(offenses - 2) {
        if current == u32::MAX {
            break;
        }
        let next = prev.saturating_add(current);
        prev = current;
        current = next;
    }
    current
}

/// A subscribed feed, or a query feed whose articles are computed.
#[derive(Clone)]
pub struct Feed {
    id: Option<FeedId>,
    record: FeedRecord,
    articles: Collection<Article>,
    dirty: bool,
}

impl Feed {
    /// An unsaved feed with an empty in-memory article collection.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: None,
            record: FeedRecord {
                title: title.into(),
                ..FeedRecord::default()
            },
            articles: Collection::new(),
            dirty: false,
        }
    }

    /// An unsaved query feed. It has no URL and never owns articles.
    pub fn new_query(title: impl Into<String>, expression: impl Into<String>) -> Self {
        let mut feed = Self::new(title);
        feed.record.query = Some(expression.into());
        feed
    }

    /// Rebuild a feed from a stored row. The result is clean.
    pub fn hydrate(id: FeedId, record: FeedRecord, articles: Collection<Article>) -> Self {
        Self {
            id: Some(id),
            record,
            articles,
            dirty: false,
        }
    }

    pub fn id(&self) -> Option<FeedId> {
        self.id
    }

    pub fn record(&self) -> &FeedRecord {
        &self.record
    }

    pub fn title(&self) -> &str {
        &self.record.title
    }

    pub fn url(&self) -> Option<&str> {
        self.record.url.as_deref()
    }

    pub fn summary(&self) -> &str {
        &self.record.summary
    }

    pub fn query(&self) -> Option<&str> {
        self.record.query.as_deref()
    }

    pub fn is_query_feed(&self) -> bool {
        self.record.query.is_some()
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.record.tags
    }

    pub fn wait_period(&self) -> u32 {
        self.record.wait_period
    }

    pub fn remaining_wait(&self) -> u32 {
        self.record.remaining_wait
    }

    pub fn image(&self) -> Option<&[u8]> {
        self.record.image.as_deref()
    }

    /// The articles this feed owns, in store order. For query feeds, the
    /// articles matching the query.
    pub fn articles(&self) -> &Collection<Article> {
        &self.articles
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Called by backends once the current values are persisted.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn set_title(&mut self, title: impl Into<String>) -> bool {
        track(&mut self.record.title, title.into(), &mut self.dirty)
    }

    pub fn set_summary(&mut self, summary: impl Into<String>) -> bool {
        track(&mut self.record.summary, summary.into(), &mut self.dirty)
    }

    /// Set the source URL. Query feeds refuse a URL.
    pub fn set_url(&mut self, url: Option<String>) -> Result<bool, ModelError> {
        if url.is_some() && self.is_query_feed() {
            return Err(ModelError::QueryFeedUrl);
        }
        Ok(track(&mut self.record.url, url, &mut self.dirty))
    }

    /// Turn this feed into a query feed (dropping any URL) or back.
    pub fn set_query(&mut self, query: Option<String>) -> bool {
        let mut changed = false;
        if query.is_some() {
            changed |= track(&mut self.record.url, None, &mut self.dirty);
        }
        changed |= track(&mut self.record.query, query, &mut self.dirty);
        changed
    }

    pub fn set_image(&mut self, image: Option<Vec<u8>>) -> bool {
        track(&mut self.record.image, image, &mut self.dirty)
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) -> bool {
        let inserted = self.record.tags.insert(tag.into());
        self.dirty |= inserted;
        inserted
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let removed = self.record.tags.remove(tag);
        self.dirty |= removed;
        removed
    }

    /// Replace the tag set wholesale.
    pub fn set_tags<I, S>(&mut self, tags: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: BTreeSet<String> = tags.into_iter().map(Into::into).collect();
        track(&mut self.record.tags, tags, &mut self.dirty)
    }

    pub fn set_wait_period(&mut self, wait_period: u32) -> bool {
        track(&mut self.record.wait_period, wait_period, &mut self.dirty)
    }

    pub fn set_remaining_wait(&mut self, remaining_wait: u32) -> bool {
        track(&mut self.record.remaining_wait, remaining_wait, &mut self.dirty)
    }

    /// Refreshes this feed still has to sit out, as computed from its offenses.
    pub fn wait_period_in_refreshes(&self) -> u32 {
        wait_period_in_refreshes(self.record.wait_period)
    }

    /// A remote update failed: one more offense, restart the wait.
    pub fn record_failure(&mut self) {
        let offenses = self.record.wait_period.saturating_add(1);
        self.set_wait_period(offenses);
        self.set_remaining_wait(wait_period_in_refreshes(offenses));
    }

    /// A remote update succeeded: the offense streak ends and the wait counts
    /// down toward zero.
    pub fn record_success(&mut self) {
        self.set_wait_period(0);
        self.set_remaining_wait(self.record.remaining_wait.saturating_sub(1));
    }

    /// Consume one refresh of waiting. Returns `true` when the feed must be
    /// skipped on this refresh.
    pub fn count_down(&mut self) -> bool {
        if self.record.remaining_wait == 0 {
            return false;
        }
        self.set_remaining_wait(self.record.remaining_wait - 1);
        true
    }

    pub(crate) fn articles_mut(&mut self) -> &mut Collection<Article> {
        &mut self.articles
    }

    /// Compare persisted values only, ignoring identity.
    pub fn same_content(&self, other: &Feed) -> bool {
        self.record == other.record
    }

    /// Detach every owned article ahead of a delete.
    ///
    /// Loads the full collection, empties it and clears each article's parent
    /// pointer. The released articles are returned to the caller.
    pub async fn release_articles(&mut self) -> Result<Vec<Article>, CollectionError> {
        if self.is_query_feed() {
            return Ok(Vec::new());
        }
        let owned = std::mem::take(self.articles.materialize().await?);
        let released = owned
            .into_iter()
            .map(|mut article| {
                article.set_feed(None);
                article
            })
            .collect();
        Ok(released)
    }
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("id", &self.id)
            .field("title", &self.record.title)
            .field("url", &self.record.url)
            .field("query", &self.record.query)
            .field("tags", &self.record.tags)
            .field("wait_period", &self.record.wait_period)
            .field("remaining_wait", &self.record.remaining_wait)
            .field("image_bytes", &self.record.image.as_ref().map(Vec::len))
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// Identity when both sides are stored, values when neither is.
impl PartialEq for Feed {
    fn eq(&self, other: &Self) -> bool {
        match (self.id, other.id) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.record == other.record,
            _ => false,
        }
    }
}

impl Eq for Feed {}

impl Hash for Feed {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.id {
            Some(id) => {
                0u8.hash(state);
                id.hash(state);
            }
            None => {
                1u8.hash(state);
                self.record.hash(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RecordId;
    use proptest::prelude::*;

    #[test]
    fn test_backoff_sequence() {
        let waits: Vec<u32> = (0..=8).map(wait_period_in_refreshes).collect();
        assert_eq!(waits, vec![0, 0, 0, 1, 1, 2, 3, 5, 8]);
        assert_eq!(wait_period_in_refreshes(9), 13);
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(wait_period_in_refreshes(u32::MAX), u32::MAX);
    }

    #[test]
    fn test_new_feed_is_clean() {
        let feed = Feed::new("Example");
        assert!(!feed.is_dirty());
        assert!(feed.id().is_none());
        assert!(feed.articles().is_materialized());
    }

    #[test]
    fn test_setting_same_value_keeps_clean() {
        let mut feed = Feed::new("Example");
        assert!(!feed.set_title("Example"));
        assert!(!feed.set_tags(Vec::<String>::new()));
        assert!(!feed.is_dirty());

        assert!(feed.set_title("Other"));
        assert!(feed.is_dirty());
    }

    #[test]
    fn test_hydrated_feed_is_clean() {
        let record = FeedRecord {
            title: "Stored".into(),
            url: Some("https://example.com/feed".into()),
            ..FeedRecord::default()
        };
        let feed = Feed::hydrate(FeedId(RecordId::Row(1)), record, Collection::new());
        assert!(!feed.is_dirty());
        assert_eq!(feed.url(), Some("https://example.com/feed"));
    }

    #[test]
    fn test_query_feed_rejects_url() {
        let mut feed = Feed::new_query("Unread", "unread");
        assert!(feed.is_query_feed());
        assert_eq!(
            feed.set_url(Some("https://example.com".into())),
            Err(ModelError::QueryFeedUrl)
        );
        assert!(feed.url().is_none());
    }

    #[test]
    fn test_set_query_clears_url() {
        let mut feed = Feed::new("Example");
        feed.set_url(Some("https://example.com/feed".into())).unwrap();
        feed.set_query(Some("unread".into()));
        assert!(feed.url().is_none());
        assert_eq!(feed.query(), Some("unread"));
    }

    #[test]
    fn test_identity_equality() {
        let a = Feed::hydrate(
            FeedId(RecordId::Row(1)),
            FeedRecord {
                title: "A".into(),
                ..FeedRecord::default()
            },
            Collection::new(),
        );
        let mut b = a.clone();
        b.set_title("Renamed");
        assert_eq!(a, b, "same stored row compares equal regardless of values");

        let c = Feed::hydrate(FeedId(RecordId::Row(2)), a.record().clone(), Collection::new());
        assert_ne!(a, c, "different rows with equal values are distinct");
        assert!(a.same_content(&c));
    }

    #[test]
    fn test_value_equality_without_ids() {
        assert_eq!(Feed::new("A"), Feed::new("A"));
        assert_ne!(Feed::new("A"), Feed::new("B"));
    }

    #[test]
    fn test_failure_and_success_drive_backoff() {
        let mut feed = Feed::new("Flaky");
        for _ in 0..5 {
            feed.record_failure();
        }
        assert_eq!(feed.wait_period(), 5);
        assert_eq!(feed.remaining_wait(), 2);

        assert!(feed.count_down());
        assert!(feed.count_down());
        assert!(!feed.count_down());

        feed.record_failure();
        assert_eq!(feed.remaining_wait(), 3);
        // Policy: a success forgives every earlier offense, so the next
        // failure starts the streak over. The current wait still only
        // counts down by one.
        feed.record_success();
        assert_eq!(feed.wait_period(), 0);
        assert_eq!(feed.remaining_wait(), 2);
        feed.record_failure();
        assert_eq!(feed.wait_period(), 1);
        assert_eq!(feed.remaining_wait(), 0);
    }

    #[tokio::test]
    async fn test_release_articles_unparents() {
        let mut feed = Feed::hydrate(
            FeedId(RecordId::Row(1)),
            FeedRecord::default(),
            Collection::new(),
        );
        let mut article = Article::new("One");
        crate::model::reparent_article(&mut article, None, &mut feed);
        assert_eq!(feed.articles().len().await.unwrap(), 1);

        let released = feed.release_articles().await.unwrap();
        assert_eq!(released.len(), 1);
        assert!(released[0].feed().is_none());
        assert_eq!(feed.articles().len().await.unwrap(), 0);
    }

    proptest! {
        #[test]
        fn prop_dirty_bit_only_on_change(first in ".{0,12}", second in ".{0,12}") {
            let mut feed = Feed::new(first.clone());
            feed.set_title(first.clone());
            prop_assert!(!feed.is_dirty());
            let changed = feed.set_title(second.clone());
            prop_assert_eq!(changed, first != second);
            prop_assert_eq!(feed.is_dirty(), first != second);
        }

        #[test]
        fn prop_wait_grows_like_fibonacci(n in 5u32..40) {
            let w = wait_period_in_refreshes;
            prop_assert_eq!(w(n), w(n - 1).saturating_add(w(n - 2)));
        }
    }
}
