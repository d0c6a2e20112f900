use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use super::ids::{ArticleId, FeedId};
use super::record::ArticleRecord;
use super::{track, Enclosure, Feed, ModelError};
use crate::storage::{Collection, CollectionError};

#[derive(Clone)]
pub struct Article {
    id: Option<ArticleId>,
    feed: Option<FeedId>,
    record: ArticleRecord,
    related: BTreeSet<ArticleId>,
    enclosures: Collection<Enclosure>,
    dirty: bool,
}

/// What an article let go of when it was released for deletion.
#[derive(Debug, Default)]
pub struct ReleasedArticle {
    pub enclosures: Vec<Enclosure>,
    pub related: BTreeSet<ArticleId>,
}

impl Article {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: None,
            feed: None,
            record: ArticleRecord {
                title: title.into(),
                ..ArticleRecord::default()
            },
            related: BTreeSet::new(),
            enclosures: Collection::new(),
            dirty: false,
        }
    }

    /// Rebuild an article from a stored row and its already-resolved parent.
    pub fn hydrate(
        id: ArticleId,
        feed: Option<FeedId>,
        mut record: ArticleRecord,
        related: BTreeSet<ArticleId>,
        enclosures: Collection<Enclosure>,
    ) -> Self {
        if !record.estimated_reading_time.is_finite() {
            record.estimated_reading_time = 0.0;
        }
        Self {
            id: Some(id),
            feed,
            record,
            related,
            enclosures,
            dirty: false,
        }
    }

    pub fn id(&self) -> Option<ArticleId> {
        self.id
    }

    /// Non-owning pointer to the feed that owns this article.
    pub fn feed(&self) -> Option<FeedId> {
        self.feed
    }

    pub fn record(&self) -> &ArticleRecord {
        &self.record
    }

    pub fn title(&self) -> &str {
        &self.record.title
    }

    pub fn link(&self) -> Option<&str> {
        self.record.link.as_deref()
    }

    pub fn summary(&self) -> &str {
        &self.record.summary
    }

    pub fn author(&self) -> &str {
        &self.record.author
    }

    pub fn published(&self) -> Option<DateTime<Utc>> {
        self.record.published
    }

    pub fn updated(&self) -> Option<DateTime<Utc>> {
        self.record.updated
    }

    pub fn content(&self) -> &str {
        &self.record.content
    }

    pub fn read(&self) -> bool {
        self.record.read
    }

    pub fn estimated_reading_time(&self) -> f64 {
        self.record.estimated_reading_time
    }

    pub fn flags(&self) -> &BTreeSet<String> {
        &self.record.flags
    }

    pub fn related(&self) -> &BTreeSet<ArticleId> {
        &self.related
    }

    pub fn enclosures(&self) -> &Collection<Enclosure> {
        &self.enclosures
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn set_title(&mut self, title: impl Into<String>) -> bool {
        track(&mut self.record.title, title.into(), &mut self.dirty)
    }

    pub fn set_link(&mut self, link: Option<String>) -> bool {
        track(&mut self.record.link, link, &mut self.dirty)
    }

    pub fn set_summary(&mut self, summary: impl Into<String>) -> bool {
        track(&mut self.record.summary, summary.into(), &mut self.dirty)
    }

    pub fn set_author(&mut self, author: impl Into<String>) -> bool {
        track(&mut self.record.author, author.into(), &mut self.dirty)
    }

    pub fn set_published(&mut self, published: Option<DateTime<Utc>>) -> bool {
        track(&mut self.record.published, published, &mut self.dirty)
    }

    pub fn set_updated(&mut self, updated: Option<DateTime<Utc>>) -> bool {
        track(&mut self.record.updated, updated, &mut self.dirty)
    }

    pub fn set_content(&mut self, content: impl Into<String>) -> bool {
        track(&mut self.record.content, content.into(), &mut self.dirty)
    }

    pub fn set_read(&mut self, read: bool) -> bool {
        track(&mut self.record.read, read, &mut self.dirty)
    }

    /// Minutes; non-finite values are stored as 0.
    pub fn set_estimated_reading_time(&mut self, minutes: f64) -> bool {
        let minutes = if minutes.is_finite() { minutes } else { 0.0 };
        track(&mut self.record.estimated_reading_time, minutes, &mut self.dirty)
    }

    pub fn add_flag(&mut self, flag: impl Into<String>) -> bool {
        let inserted = self.record.flags.insert(flag.into());
        self.dirty |= inserted;
        inserted
    }

    pub fn remove_flag(&mut self, flag: &str) -> bool {
        let removed = self.record.flags.remove(flag);
        self.dirty |= removed;
        removed
    }

    pub fn set_flags<I, S>(&mut self, flags: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let flags: BTreeSet<String> = flags.into_iter().map(Into::into).collect();
        track(&mut self.record.flags, flags, &mut self.dirty)
    }

    pub(crate) fn set_feed(&mut self, feed: Option<FeedId>) -> bool {
        track(&mut self.feed, feed, &mut self.dirty)
    }

    pub(crate) fn enclosures_mut(&mut self) -> &mut Collection<Enclosure> {
        &mut self.enclosures
    }

    /// Relate two articles in both directions.
    ///
    /// Relating an article to itself is ignored. Both endpoints must be stored
    /// since the relation is kept as identifiers. Returns whether any edge was
    /// added; both ends are marked dirty when one was.
    pub fn relate(&mut self, other: &mut Article) -> Result<bool, ModelError> {
        if *self == *other {
            return Ok(false);
        }
        let (Some(a), Some(b)) = (self.id, other.id) else {
            return Err(ModelError::Unsaved("article"));
        };
        let added = self.related.insert(b) | other.related.insert(a);
        if added {
            self.dirty = true;
            other.dirty = true;
        }
        Ok(added)
    }

    /// Remove the edge between two articles from both sides.
    pub fn unrelate(&mut self, other: &mut Article) -> bool {
        let (Some(a), Some(b)) = (self.id, other.id) else {
            return false;
        };
        let removed = self.related.remove(&b) | other.related.remove(&a);
        if removed {
            self.dirty = true;
            other.dirty = true;
        }
        removed
    }

    pub fn is_related_to(&self, other: &Article) -> bool {
        other.id.is_some_and(|id| self.related.contains(&id))
    }

    /// Replace the stored edge set, used when rebuilding relations by id.
    pub fn set_related(&mut self, related: BTreeSet<ArticleId>) -> bool {
        let related = match self.id {
            Some(own) => related.into_iter().filter(|id| *id != own).collect(),
            None => related,
        };
        track(&mut self.related, related, &mut self.dirty)
    }

    /// Compare persisted values only, ignoring identity and the derived
    /// reading time.
    pub fn same_content(&self, other: &Article) -> bool {
        self.record.same_content(&other.record)
    }

    /// Detach enclosures and related edges ahead of a delete.
    pub async fn release(&mut self) -> Result<ReleasedArticle, CollectionError> {
        let owned = std::mem::take(self.enclosures.materialize().await?);
        let enclosures = owned
            .into_iter()
            .map(|mut enclosure| {
                enclosure.set_article(None);
                enclosure
            })
            .collect();
        let related = std::mem::take(&mut self.related);
        self.dirty |= !related.is_empty();
        Ok(ReleasedArticle {
            enclosures,
            related,
        })
    }
}

/// Move `article` under `to`, taking it out of `from`.
///
/// Assigning to a query feed leaves everything untouched: query feeds never own
/// articles. In-memory collections move the article between them; collections
/// backed by a stored query are invalidated and pick the change up from the
/// article's parent pointer once it is saved.
pub fn reparent_article(article: &mut Article, from: Option<&mut Feed>, to: &mut Feed) {
    if to.is_query_feed() {
        tracing::debug!(feed = %to.title(), "Ignoring article assignment to a query feed");
        return;
    }
    if let Some(from) = from {
        from.articles_mut().detach(article);
    }
    to.articles_mut().detach(article);
    article.set_feed(to.id());
    to.articles_mut().attach(article.clone());
}

impl std::fmt::Debug for Article {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Article")
            .field("id", &self.id)
            .field("feed", &self.feed)
            .field("title", &self.record.title)
            .field("link", &self.record.link)
            .field("read", &self.record.read)
            .field("flags", &self.record.flags)
            .field("related", &self.related)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl PartialEq for Article {
    fn eq(&self, other: &Self) -> bool {
        match (self.id, other.id) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.record == other.record,
            _ => false,
        }
    }
}

impl Eq for Article {}

impl Hash for Article {
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
    use crate::model::{FeedRecord, RecordId};
    use proptest::prelude::*;

    fn stored(n: i64, title: &str) -> Article {
        Article::hydrate(
            ArticleId(RecordId::Row(n)),
            None,
            ArticleRecord {
                title: title.into(),
                ..ArticleRecord::default()
            },
            BTreeSet::new(),
            Collection::new(),
        )
    }

    fn stored_feed(n: i64) -> Feed {
        Feed::hydrate(FeedId(RecordId::Row(n)), FeedRecord::default(), Collection::new())
    }

    #[test]
    fn test_relate_is_symmetric() {
        let mut a = stored(1, "A");
        let mut b = stored(2, "B");
        assert!(a.relate(&mut b).unwrap());
        assert!(a.is_related_to(&b));
        assert!(b.is_related_to(&a));
        assert!(a.is_dirty() && b.is_dirty());

        assert!(b.unrelate(&mut a));
        assert!(!a.is_related_to(&b));
        assert!(!b.is_related_to(&a));
    }

    #[test]
    fn test_relate_same_row_is_ignored() {
        let mut a = stored(1, "A");
        let mut copy = a.clone();
        assert!(!a.relate(&mut copy).unwrap());
        assert!(a.related().is_empty());
        assert!(!a.is_dirty());
    }

    #[test]
    fn test_relate_requires_ids() {
        let mut a = Article::new("A");
        let mut b = stored(2, "B");
        assert_eq!(a.relate(&mut b), Err(ModelError::Unsaved("article")));
        assert!(b.related().is_empty());
    }

    #[test]
    fn test_set_related_drops_self_edge() {
        let mut a = stored(1, "A");
        let own = a.id().unwrap();
        a.set_related([own, ArticleId(RecordId::Row(9))].into_iter().collect());
        assert_eq!(a.related().len(), 1);
    }

    #[test]
    fn test_reading_time_rejects_nan() {
        let mut a = Article::new("A");
        a.set_estimated_reading_time(f64::NAN);
        assert_eq!(a.estimated_reading_time(), 0.0);
        assert!(!a.is_dirty());
    }

    #[tokio::test]
    async fn test_reparent_moves_between_feeds() {
        let mut first = stored_feed(1);
        let mut second = stored_feed(2);
        let mut article = stored(10, "Moving");

        reparent_article(&mut article, None, &mut first);
        assert_eq!(article.feed(), first.id());
        assert!(first.articles().contains(&article).await.unwrap());

        reparent_article(&mut article, Some(&mut first), &mut second);
        assert_eq!(article.feed(), second.id());
        assert!(!first.articles().contains(&article).await.unwrap());
        assert!(second.articles().contains(&article).await.unwrap());
    }

    #[tokio::test]
    async fn test_reparent_into_query_feed_is_noop() {
        let mut owner = stored_feed(1);
        let mut query = Feed::new_query("Unread", "unread");
        let mut article = stored(10, "Stays");
        reparent_article(&mut article, None, &mut owner);
        article.mark_clean();

        reparent_article(&mut article, Some(&mut owner), &mut query);
        assert_eq!(article.feed(), owner.id());
        assert!(!article.is_dirty());
        assert!(owner.articles().contains(&article).await.unwrap());
        assert_eq!(query.articles().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_clears_edges_and_enclosures() {
        let mut a = stored(1, "A");
        let mut b = stored(2, "B");
        a.relate(&mut b).unwrap();
        let mut enclosure = Enclosure::new("https://example.com/a.mp3", "audio/mpeg");
        crate::model::reparent_enclosure(&mut enclosure, None, &mut a);

        let released = a.release().await.unwrap();
        assert_eq!(released.enclosures.len(), 1);
        assert!(released.enclosures[0].article().is_none());
        assert!(released.related.contains(&b.id().unwrap()));
        assert!(a.related().is_empty());
    }

    proptest! {
        #[test]
        fn prop_relation_stays_symmetric(ops in proptest::collection::vec((0usize..4, 0usize..4, any::<bool>()), 0..40)) {
            let mut articles: Vec<Article> = (0..4).map(|n| stored(n as i64, "x")).collect();
            for (i, j, add) in ops {
                if i == j {
                    let mut copy = articles[i].clone();
                    if add {
                        articles[i].relate(&mut copy).unwrap();
                    }
                    continue;
                }
                let (lo, hi) = (i.min(j), i.max(j));
                let (left, right) = articles.split_at_mut(hi);
                let (a, b) = (&mut left[lo], &mut right[0]);
                if add {
                    a.relate(b).unwrap();
                } else {
                    a.unrelate(b);
                }
            }
            for a in &articles {
                prop_assert!(!a.is_related_to(a));
                for b in &articles {
                    prop_assert_eq!(a.is_related_to(b), b.is_related_to(a));
                }
            }
        }

        #[test]
        fn prop_ownership_is_exclusive(moves in proptest::collection::vec(0usize..3, 1..20)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let mut feeds: Vec<Feed> = (0..3).map(|n| stored_feed(n as i64)).collect();
                let mut article = stored(100, "wanderer");
                let mut current: Option<usize> = None;
                for target in moves {
                    match current {
                        Some(from) if from != target => {
                            let (lo, hi) = (from.min(target), from.max(target));
                            let (left, right) = feeds.split_at_mut(hi);
                            let (from_feed, to_feed) = if from < target {
                                (&mut left[lo], &mut right[0])
                            } else {
                                (&mut right[0], &mut left[lo])
                            };
                            reparent_article(&mut article, Some(from_feed), to_feed);
                        }
                        Some(_) => {}
                        None => reparent_article(&mut article, None, &mut feeds[target]),
                    }
                    current = Some(target);
                    let mut owners = 0;
                    for feed in &feeds {
                        if feed.articles().contains(&article).await.unwrap() {
                            owners += 1;
                        }
                    }
                    assert_eq!(owners, 1);
                }
            });
        }
    }
}
