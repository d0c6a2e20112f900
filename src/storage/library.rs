//! Backend-independent operations layered on top of [`StorageBackend`].
//!
//! The [`Library`] applies parsed feed documents to stored feeds, upserts
//! enclosures, removes entities together with their in-memory relationships,
//! and keeps an optional search index in step. Index updates are
//! fire-and-forget: their outcome never affects the save they follow.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use thiserror::Error;

use super::collection::{Collection, CollectionError, DEFAULT_CACHED_PAGES, DEFAULT_PAGE_SIZE};
use super::port::{BackendError, Query, StorageBackend, Window};
use super::predicate::Predicate;
use crate::feed::{ParsedEnclosure, ParsedFeed, ParsedItem};
use crate::model::{Article, ArticleId, Enclosure, Entity, Feed, FeedId};
use crate::util::estimate_reading_time;

pub const DEFAULT_UPSERT_CONCURRENCY: usize = 8;

// ============================================================================
// Search index
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
#[error("Search index error: {0}")]
pub struct IndexError(pub String);

/// What the search index gets to see of an article.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub id: ArticleId,
    pub feed: Option<FeedId>,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub link: Option<String>,
}

impl IndexDocument {
    /// `None` for articles that were never stored.
    pub fn from_article(article: &Article) -> Option<Self> {
        Some(Self {
            id: article.id()?,
            feed: article.feed(),
            title: article.title().to_string(),
            summary: article.summary().to_string(),
            content: article.content().to_string(),
            link: article.link().map(str::to_string),
        })
    }
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn add_items(&self, items: Vec<IndexDocument>) -> Result<(), IndexError>;
    async fn delete_items(&self, ids: Vec<ArticleId>) -> Result<(), IndexError>;
}

// ============================================================================
// Library
// ============================================================================

/// Outcome of applying one parsed document to a feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

impl From<CollectionError> for BackendError {
    fn from(err: CollectionError) -> Self {
        match err {
            CollectionError::Backend(inner) => inner,
            other => BackendError::unknown(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct Library {
    backend: Arc<dyn StorageBackend>,
    index: Option<Arc<dyn SearchIndex>>,
    upsert_concurrency: usize,
    page_size: usize,
    cached_pages: usize,
}

impl Library {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            index: None,
            upsert_concurrency: DEFAULT_UPSERT_CONCURRENCY,
            page_size: DEFAULT_PAGE_SIZE,
            cached_pages: DEFAULT_CACHED_PAGES,
        }
    }

    pub fn with_search_index(mut self, index: Arc<dyn SearchIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_upsert_concurrency(mut self, concurrency: usize) -> Self {
        self.upsert_concurrency = concurrency.max(1);
        self
    }

    pub fn with_paging(mut self, page_size: usize, cached_pages: usize) -> Self {
        self.page_size = page_size.max(1);
        self.cached_pages = cached_pages.max(1);
        self
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    fn view<T: crate::model::Stored>(&self, query: Query) -> Collection<T> {
        Collection::of(query, Arc::clone(&self.backend)).with_paging(self.page_size, self.cached_pages)
    }

    /// All feeds, in store order.
    pub fn feeds(&self) -> Collection<Feed> {
        self.view(Query::feeds(Predicate::All))
    }

    pub fn feeds_tagged(&self, tag: &str) -> Collection<Feed> {
        self.view(Query::feeds(Predicate::Tagged(tag.to_string())))
    }

    /// The articles a feed owns, or those its query selects.
    pub fn articles_of(&self, feed: &Feed) -> Collection<Article> {
        match article_predicate(feed) {
            Some(predicate) => self.view(Query::articles(predicate)),
            None => Collection::new(),
        }
    }

    pub fn unread_articles_of(&self, feed: &Feed) -> Collection<Article> {
        match article_predicate(feed) {
            Some(predicate) => self.view(Query::articles(predicate.and(Predicate::Unread))),
            None => Collection::new(),
        }
    }

    pub async fn feed_with_url(&self, url: &str) -> Result<Option<Feed>, BackendError> {
        let found = self
            .backend
            .entities_matching(
                &Query::feeds(Predicate::UrlEquals(url.to_string())),
                Window::new(0, 1),
            )
            .await?;
        Ok(found.into_iter().find_map(|entity| match entity {
            Entity::Feed(feed) => Some(feed),
            _ => None,
        }))
    }

    // ------------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------------

    /// Store a new subscription.
    pub async fn subscribe<I, S>(&self, url: &str, title: &str, tags: I) -> Result<Feed, BackendError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut feed = self.backend.create_feed().await?;
        feed.set_title(title);
        feed.set_url(Some(url.to_string()))
            .map_err(|e| BackendError::write_failure(e.to_string()))?;
        feed.set_tags(tags);
        self.backend.save_feed(&mut feed).await?;
        tracing::debug!(feed = %url, backend = self.backend.name(), "Subscribed");
        Ok(feed)
    }

    /// Store a new query feed.
    pub async fn add_query_feed(&self, title: &str, expression: &str) -> Result<Feed, BackendError> {
        Predicate::parse_expression(expression)
            .map_err(|e| BackendError::write_failure(e.to_string()))?;
        let mut feed = self.backend.create_feed().await?;
        feed.set_title(title);
        feed.set_query(Some(expression.to_string()));
        self.backend.save_feed(&mut feed).await?;
        // Re-read so the article view reflects the query.
        let id = feed.id().map(|id| id.record());
        let stored = match id {
            Some(id) => self
                .backend
                .entities_matching(&Query::feeds(Predicate::Id(id)), Window::new(0, 1))
                .await?
                .into_iter()
                .find_map(|entity| match entity {
                    Entity::Feed(feed) => Some(feed),
                    _ => None,
                }),
            None => None,
        };
        Ok(stored.unwrap_or(feed))
    }

    // ------------------------------------------------------------------------
    // Upserts
    // ------------------------------------------------------------------------

    /// Apply a parsed document to `feed`.
    ///
    /// Each item updates the article with the same title or link, or creates
    /// a new one. Items are upserted concurrently; the feed is saved once all
    /// of them have finished. Individual item failures are logged and counted
    /// but do not abort the others.
    pub async fn update_feed(
        &self,
        feed: &mut Feed,
        parsed: &ParsedFeed,
    ) -> Result<ApplySummary, BackendError> {
        if !parsed.title.trim().is_empty() {
            feed.set_title(parsed.title.trim());
        }
        feed.set_summary(parsed.description.as_str());

        let existing = if feed.is_query_feed() {
            Vec::new()
        } else {
            feed.articles().to_vec().await?
        };

        let mut claimed = vec![false; existing.len()];
        let jobs: Vec<(Option<Article>, &ParsedItem)> = parsed
            .items
            .iter()
            .map(|item| {
                let position = existing
                    .iter()
                    .enumerate()
                    .position(|(i, article)| !claimed[i] && item_matches(item, article));
                let matched = position.map(|i| {
                    claimed[i] = true;
                    existing[i].clone()
                });
                (matched, item)
            })
            .collect();

        let parent: &Feed = feed;
        let results: Vec<Result<(Article, bool), BackendError>> = stream::iter(jobs)
            .map(|(matched, item)| self.upsert_article(parent, matched, item))
            .buffer_unordered(self.upsert_concurrency)
            .collect()
            .await;

        let mut summary = ApplySummary::default();
        let mut documents = Vec::new();
        let mut upserted = Vec::new();
        for result in results {
            match result {
                Ok((article, created)) => {
                    if created {
                        summary.created += 1;
                    } else {
                        summary.updated += 1;
                    }
                    documents.extend(IndexDocument::from_article(&article));
                    upserted.push(article);
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        feed = %feed.url().unwrap_or(feed.title()),
                        error = %e,
                        "Failed to upsert article"
                    );
                }
            }
        }

        for article in upserted {
            feed.articles_mut().sync_item(article);
        }
        self.index_articles(documents);

        self.backend.save_feed(feed).await?;
        tracing::debug!(
            feed = %feed.url().unwrap_or(feed.title()),
            created = summary.created,
            updated = summary.updated,
            failed = summary.failed,
            "Applied feed document"
        );
        Ok(summary)
    }

    async fn upsert_article(
        &self,
        feed: &Feed,
        matched: Option<Article>,
        item: &ParsedItem,
    ) -> Result<(Article, bool), BackendError> {
        let (mut article, created) = match matched {
            Some(article) => (article, false),
            None => (self.backend.create_article(Some(feed)).await?, true),
        };

        article.set_title(item.title.as_str());
        article.set_link(item.link.clone());
        article.set_summary(item.description.as_str());
        article.set_author(item.authors.join(", "));
        article.set_published(item.published);
        article.set_updated(item.updated);
        let content = item.content.as_deref().unwrap_or(&item.description);
        article.set_content(content);
        article.set_estimated_reading_time(estimate_reading_time(content));

        if created || article.is_dirty() {
            self.backend.save_article(&mut article).await?;
        }

        for enclosure in &item.enclosures {
            self.upsert_enclosure(&mut article, enclosure).await?;
        }
        Ok((article, created))
    }

    /// Update the enclosure of `article` with the same URL, or create one.
    pub async fn upsert_enclosure(
        &self,
        article: &mut Article,
        parsed: &ParsedEnclosure,
    ) -> Result<Enclosure, BackendError> {
        let existing = article.enclosures().to_vec().await?;
        if let Some(mut enclosure) = existing.into_iter().find(|e| e.url() == parsed.url) {
            if enclosure.set_kind(parsed.kind.as_str()) {
                self.backend.save_enclosure(&mut enclosure).await?;
                article.enclosures_mut().sync_item(enclosure.clone());
            }
            return Ok(enclosure);
        }

        let mut enclosure = self.backend.create_enclosure(Some(&*article)).await?;
        enclosure.set_url(parsed.url.as_str());
        enclosure.set_kind(parsed.kind.as_str());
        self.backend.save_enclosure(&mut enclosure).await?;
        article.enclosures_mut().sync_item(enclosure.clone());
        Ok(enclosure)
    }

    // ------------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------------

    /// Delete a feed and everything it owns.
    pub async fn remove_feed(&self, mut feed: Feed) -> Result<(), BackendError> {
        let released = feed.release_articles().await?;
        let ids: Vec<ArticleId> = released.iter().filter_map(Article::id).collect();
        let label = feed.url().unwrap_or(feed.title()).to_string();
        self.backend.delete_feed(feed).await?;
        tracing::debug!(feed = %label, articles = ids.len(), "Removed feed");
        self.unindex_articles(ids);
        Ok(())
    }

    /// Delete an article together with its enclosures and related edges.
    pub async fn remove_article(&self, mut article: Article) -> Result<(), BackendError> {
        let released = article.release().await?;
        let id = article.id();
        self.backend.delete_article(article).await?;
        tracing::debug!(
            enclosures = released.enclosures.len(),
            related = released.related.len(),
            "Removed article"
        );
        self.unindex_articles(id.into_iter().collect());
        Ok(())
    }

    fn index_articles(&self, documents: Vec<IndexDocument>) {
        let Some(index) = self.index.clone() else {
            return;
        };
        if documents.is_empty() {
            return;
        }
        tokio::spawn(async move {
            let count = documents.len();
            if let Err(e) = index.add_items(documents).await {
                tracing::warn!(error = %e, count, "Search index update failed");
            }
        });
    }

    fn unindex_articles(&self, ids: Vec<ArticleId>) {
        let Some(index) = self.index.clone() else {
            return;
        };
        if ids.is_empty() {
            return;
        }
        tokio::spawn(async move {
            let count = ids.len();
            if let Err(e) = index.delete_items(ids).await {
                tracing::warn!(error = %e, count, "Search index removal failed");
            }
        });
    }
}

fn article_predicate(feed: &Feed) -> Option<Predicate> {
    super::feed_article_predicate(feed.id(), feed.query())
}

/// Title-or-link equality. Empty titles never match on their own.
fn item_matches(item: &ParsedItem, article: &Article) -> bool {
    let same_link = item.link.is_some() && item.link.as_deref() == article.link();
    let same_title = !item.title.is_empty() && item.title == article.title();
    same_link || same_title
}
