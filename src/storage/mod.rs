//! Persistence: the backend port, its two implementations, lazy collections
//! and the backend-independent [`Library`] layered on top.

mod collection;
mod library;
mod object;
mod port;
mod predicate;
mod sqlite;

use std::sync::Arc;

pub use collection::{Collection, CollectionError, DEFAULT_CACHED_PAGES, DEFAULT_PAGE_SIZE};
pub use library::{
    ApplySummary, IndexDocument, IndexError, Library, SearchIndex, DEFAULT_UPSERT_CONCURRENCY,
};
pub use object::ObjectStore;
pub use port::{BackendError, BackendErrorKind, Query, StorageBackend, Window};
pub use predicate::{ExpressionError, Predicate, Subject};
pub use sqlite::SqliteStore;

use crate::model::{Article, ArticleId, Enclosure, FeedId};

/// The predicate selecting a feed's articles: its query for query feeds,
/// ownership otherwise. `None` when neither applies.
pub(crate) fn feed_article_predicate(id: Option<FeedId>, query: Option<&str>) -> Option<Predicate> {
    match query {
        Some(expression) => match Predicate::parse_expression(expression) {
            Ok(predicate) => Some(predicate),
            Err(e) => {
                tracing::warn!(expression, error = %e, "Invalid query expression");
                None
            }
        },
        None => id.map(|id| Predicate::Parent(id.record())),
    }
}

/// Article view for a hydrated feed.
pub(crate) fn articles_of_feed(
    backend: Arc<dyn StorageBackend>,
    id: FeedId,
    query: Option<&str>,
) -> Collection<Article> {
    match feed_article_predicate(Some(id), query) {
        Some(predicate) => Collection::of(Query::articles(predicate), backend),
        None => Collection::new(),
    }
}

/// Enclosure view for a hydrated article.
pub(crate) fn enclosures_of(backend: Arc<dyn StorageBackend>, id: ArticleId) -> Collection<Enclosure> {
    Collection::of(Query::enclosures(Predicate::Parent(id.record())), backend)
}
