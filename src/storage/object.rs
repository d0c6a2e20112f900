//! In-process object-graph backend.
//!
//! Rows live in insertion-ordered vectors behind a mutex and are keyed by
//! UUIDs. When opened on a path the whole graph is written back as a JSON
//! snapshot after every change (temp file + rename), and loaded from it on
//! open.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::port::{BackendError, Query, StorageBackend, Window};
use super::predicate::Subject;
use super::{enclosures_of, articles_of_feed};
use crate::model::{
    Article, ArticleId, ArticleRecord, Enclosure, EnclosureId, EnclosureRecord, Entity,
    EntityKind, Feed, FeedId, FeedRecord, RecordId,
};

/// Maximum snapshot size accepted on open (256 MiB).
const MAX_SNAPSHOT_SIZE: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FeedRow {
    id: Uuid,
    record: FeedRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArticleRow {
    id: Uuid,
    feed: Option<Uuid>,
    record: ArticleRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EnclosureRow {
    id: Uuid,
    article: Option<Uuid>,
    record: EnclosureRecord,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct Graph {
    feeds: Vec<FeedRow>,
    articles: Vec<ArticleRow>,
    enclosures: Vec<EnclosureRow>,
    /// Unordered article pairs, stored smaller id first.
    related: BTreeSet<(Uuid, Uuid)>,
}

struct Inner {
    graph: Mutex<Graph>,
    snapshot: Option<PathBuf>,
    /// Held for the whole of every write, so writers never interleave.
    write_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<Inner>,
}

impl ObjectStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::with_graph(Graph::default(), None)
    }

    /// Open (or start) a store snapshotted at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let graph = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.len() > MAX_SNAPSHOT_SIZE => {
                return Err(BackendError::unknown(format!(
                    "snapshot {} is {} bytes (max {MAX_SNAPSHOT_SIZE})",
                    path.display(),
                    meta.len()
                )));
            }
            Ok(_) => {
                let bytes = tokio::fs::read(path).await?;
                if bytes.is_empty() {
                    Graph::default()
                } else {
                    serde_json::from_slice(&bytes)?
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Graph::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(
            path = %path.display(),
            feeds = graph.feeds.len(),
            articles = graph.articles.len(),
            "Opened object store"
        );
        Ok(Self::with_graph(graph, Some(path.to_path_buf())))
    }

    fn with_graph(graph: Graph, snapshot: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                graph: Mutex::new(graph),
                snapshot,
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn graph(&self) -> Result<MutexGuard<'_, Graph>, BackendError> {
        self.inner
            .graph
            .lock()
            .map_err(|_| BackendError::unknown("object store lock poisoned"))
    }

    fn backend(&self) -> Arc<dyn StorageBackend> {
        Arc::new(self.clone())
    }

    /// Apply `change` and make it visible only once it is on disk.
    ///
    /// Snapshotted stores apply the change to a copy of the graph, write the
    /// copy out and only then swap it in, so a failed write leaves both the
    /// file and the live graph as they were. `change` must not mutate the
    /// graph before returning an error.
    async fn write<R>(
        &self,
        change: impl FnOnce(&mut Graph) -> Result<R, BackendError>,
    ) -> Result<R, BackendError> {
        let _writer = self.inner.write_lock.lock().await;
        let Some(path) = &self.inner.snapshot else {
            let mut graph = self.graph()?;
            return change(&mut graph);
        };
        let mut candidate = self.graph()?.clone();
        let out = change(&mut candidate)?;
        persist(path, &candidate).await?;
        *self.graph()? = candidate;
        Ok(out)
    }

    // ------------------------------------------------------------------------
    // Hydration
    // ------------------------------------------------------------------------

    fn hydrate_feed(&self, row: &FeedRow) -> Feed {
        let id = FeedId(RecordId::Object(row.id));
        let articles = articles_of_feed(self.backend(), id, row.record.query.as_deref());
        Feed::hydrate(id, row.record.clone(), articles)
    }

    fn hydrate_article(&self, graph: &Graph, row: &ArticleRow) -> Article {
        let id = ArticleId(RecordId::Object(row.id));
        let related = graph
            .related
            .iter()
            .filter_map(|&(a, b)| {
                if a == row.id {
                    Some(b)
                } else if b == row.id {
                    Some(a)
                } else {
                    None
                }
            })
            .map(|other| ArticleId(RecordId::Object(other)))
            .collect();
        Article::hydrate(
            id,
            row.feed.map(|feed| FeedId(RecordId::Object(feed))),
            row.record.clone(),
            related,
            enclosures_of(self.backend(), id),
        )
    }

    fn hydrate_enclosure(row: &EnclosureRow) -> Enclosure {
        Enclosure::hydrate(
            EnclosureId(RecordId::Object(row.id)),
            row.article.map(|article| ArticleId(RecordId::Object(article))),
            row.record.clone(),
        )
    }
}

/// Write `graph` to `path` through a temp file and a rename.
async fn persist(path: &Path, graph: &Graph) -> Result<(), BackendError> {
    let bytes = serde_json::to_vec(graph)?;
    let temp_path = path.with_extension(format!("tmp.{}", Uuid::new_v4().simple()));
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    if let Err(e) = tokio::fs::write(&temp_path, &bytes).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    Ok(())
}

fn object_id(id: Option<RecordId>, kind: EntityKind) -> Result<Uuid, BackendError> {
    let id = id.ok_or_else(|| BackendError::unsaved(kind))?;
    id.as_object()
        .ok_or_else(|| BackendError::not_found(format!("{kind} {id} belongs to another store")))
}

fn pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl Graph {
    fn has_feed(&self, id: Uuid) -> bool {
        self.feeds.iter().any(|row| row.id == id)
    }

    fn has_article(&self, id: Uuid) -> bool {
        self.articles.iter().any(|row| row.id == id)
    }

    /// Drop the given articles together with their enclosures and edges.
    fn remove_articles(&mut self, doomed: &BTreeSet<Uuid>) {
        self.articles.retain(|row| !doomed.contains(&row.id));
        self.enclosures
            .retain(|row| !row.article.is_some_and(|a| doomed.contains(&a)));
        self.related
            .retain(|(a, b)| !doomed.contains(a) && !doomed.contains(b));
    }
}

#[async_trait]
impl StorageBackend for ObjectStore {
    fn name(&self) -> &'static str {
        "object"
    }

    async fn create_feed(&self) -> Result<Feed, BackendError> {
        let row = FeedRow {
            id: Uuid::new_v4(),
            record: FeedRecord::default(),
        };
        self.write(|graph| {
            graph.feeds.push(row.clone());
            Ok(())
        })
        .await?;
        Ok(self.hydrate_feed(&row))
    }

    async fn create_article(&self, feed: Option<&Feed>) -> Result<Article, BackendError> {
        let parent = match feed {
            Some(feed) if !feed.is_query_feed() => Some(object_id(
                feed.id().map(|id| id.record()),
                EntityKind::Feed,
            )?),
            _ => None,
        };
        let row = ArticleRow {
            id: Uuid::new_v4(),
            feed: parent,
            record: ArticleRecord::default(),
        };
        self.write(|graph| {
            if let Some(parent) = parent {
                if !graph.has_feed(parent) {
                    return Err(BackendError::not_found(format!("feed obj:{parent}")));
                }
            }
            graph.articles.push(row.clone());
            Ok(())
        })
        .await?;
        let graph = self.graph()?;
        Ok(self.hydrate_article(&graph, &row))
    }

    async fn create_enclosure(&self, article: Option<&Article>) -> Result<Enclosure, BackendError> {
        let parent = match article {
            Some(article) => Some(object_id(
                article.id().map(|id| id.record()),
                EntityKind::Article,
            )?),
            None => None,
        };
        let row = EnclosureRow {
            id: Uuid::new_v4(),
            article: parent,
            record: EnclosureRecord::default(),
        };
        self.write(|graph| {
            if let Some(parent) = parent {
                if !graph.has_article(parent) {
                    return Err(BackendError::not_found(format!("article obj:{parent}")));
                }
            }
            graph.enclosures.push(row.clone());
            Ok(())
        })
        .await?;
        Ok(Self::hydrate_enclosure(&row))
    }

    async fn count_matching(&self, query: &Query) -> Result<usize, BackendError> {
        let graph = self.graph()?;
        let count = match query.kind {
            EntityKind::Feed => graph
                .feeds
                .iter()
                .filter(|row| query.predicate.matches(*row))
                .count(),
            EntityKind::Article => graph
                .articles
                .iter()
                .filter(|row| query.predicate.matches(*row))
                .count(),
            EntityKind::Enclosure => graph
                .enclosures
                .iter()
                .filter(|row| query.predicate.matches(*row))
                .count(),
        };
        Ok(count)
    }

    async fn entities_matching(
        &self,
        query: &Query,
        window: Window,
    ) -> Result<Vec<Entity>, BackendError> {
        let graph = self.graph()?;
        let entities = match query.kind {
            EntityKind::Feed => graph
                .feeds
                .iter()
                .filter(|row| query.predicate.matches(*row))
                .skip(window.offset)
                .take(window.limit)
                .map(|row| Entity::Feed(self.hydrate_feed(row)))
                .collect(),
            EntityKind::Article => graph
                .articles
                .iter()
                .filter(|row| query.predicate.matches(*row))
                .skip(window.offset)
                .take(window.limit)
                .map(|row| Entity::Article(self.hydrate_article(&graph, row)))
                .collect(),
            EntityKind::Enclosure => graph
                .enclosures
                .iter()
                .filter(|row| query.predicate.matches(*row))
                .skip(window.offset)
                .take(window.limit)
                .map(|row| Entity::Enclosure(Self::hydrate_enclosure(row)))
                .collect(),
        };
        Ok(entities)
    }

    async fn save_feed(&self, feed: &mut Feed) -> Result<(), BackendError> {
        let id = object_id(feed.id().map(|id| id.record()), EntityKind::Feed)?;
        let record = feed.record().clone();
        self.write(|graph| {
            let row = graph
                .feeds
                .iter_mut()
                .find(|row| row.id == id)
                .ok_or_else(|| BackendError::not_found(format!("feed obj:{id}")))?;
            row.record = record;
            Ok(())
        })
        .await?;
        feed.mark_clean();
        Ok(())
    }

    async fn save_article(&self, article: &mut Article) -> Result<(), BackendError> {
        let id = object_id(article.id().map(|id| id.record()), EntityKind::Article)?;
        let parent = article
            .feed()
            .map(|feed| object_id(Some(feed.record()), EntityKind::Feed))
            .transpose()?;
        let record = article.record().clone();
        let related: Vec<Uuid> = article
            .related()
            .iter()
            .filter_map(|other| other.record().as_object())
            .filter(|other| *other != id)
            .collect();
        self.write(|graph| {
            if let Some(parent) = parent {
                if !graph.has_feed(parent) {
                    return Err(BackendError::not_found(format!("feed obj:{parent}")));
                }
            }
            // Edges to rows that no longer exist are dropped.
            let others: Vec<Uuid> = related
                .into_iter()
                .filter(|other| graph.has_article(*other))
                .collect();
            let row = graph
                .articles
                .iter_mut()
                .find(|row| row.id == id)
                .ok_or_else(|| BackendError::not_found(format!("article obj:{id}")))?;
            row.feed = parent;
            row.record = record;
            graph.related.retain(|(a, b)| *a != id && *b != id);
            graph
                .related
                .extend(others.into_iter().map(|other| pair(id, other)));
            Ok(())
        })
        .await?;
        article.mark_clean();
        Ok(())
    }

    async fn save_enclosure(&self, enclosure: &mut Enclosure) -> Result<(), BackendError> {
        let id = object_id(enclosure.id().map(|id| id.record()), EntityKind::Enclosure)?;
        let parent = enclosure
            .article()
            .map(|article| object_id(Some(article.record()), EntityKind::Article))
            .transpose()?;
        let record = enclosure.record().clone();
        self.write(|graph| {
            if let Some(parent) = parent {
                if !graph.has_article(parent) {
                    return Err(BackendError::not_found(format!("article obj:{parent}")));
                }
            }
            let row = graph
                .enclosures
                .iter_mut()
                .find(|row| row.id == id)
                .ok_or_else(|| BackendError::not_found(format!("enclosure obj:{id}")))?;
            row.article = parent;
            row.record = record;
            Ok(())
        })
        .await?;
        enclosure.mark_clean();
        Ok(())
    }

    async fn delete_feed(&self, feed: Feed) -> Result<(), BackendError> {
        let id = object_id(feed.id().map(|id| id.record()), EntityKind::Feed)?;
        self.write(|graph| {
            if !graph.has_feed(id) {
                return Err(BackendError::not_found(format!("feed obj:{id}")));
            }
            graph.feeds.retain(|row| row.id != id);
            let doomed: BTreeSet<Uuid> = graph
                .articles
                .iter()
                .filter(|row| row.feed == Some(id))
                .map(|row| row.id)
                .collect();
            graph.remove_articles(&doomed);
            Ok(())
        })
        .await
    }

    async fn delete_article(&self, article: Article) -> Result<(), BackendError> {
        let id = object_id(article.id().map(|id| id.record()), EntityKind::Article)?;
        self.write(|graph| {
            if !graph.has_article(id) {
                return Err(BackendError::not_found(format!("article obj:{id}")));
            }
            graph.remove_articles(&BTreeSet::from([id]));
            Ok(())
        })
        .await
    }

    async fn delete_enclosure(&self, enclosure: Enclosure) -> Result<(), BackendError> {
        let id = object_id(enclosure.id().map(|id| id.record()), EntityKind::Enclosure)?;
        self.write(|graph| {
            if !graph.enclosures.iter().any(|row| row.id == id) {
                return Err(BackendError::not_found(format!("enclosure obj:{id}")));
            }
            graph.enclosures.retain(|row| row.id != id);
            Ok(())
        })
        .await
    }
}

// ============================================================================
// Predicate subjects
// ============================================================================

impl Subject for FeedRow {
    fn subject_id(&self) -> Option<RecordId> {
        Some(RecordId::Object(self.id))
    }

    fn subject_parent(&self) -> Option<RecordId> {
        None
    }

    fn subject_labels(&self) -> Option<&BTreeSet<String>> {
        Some(&self.record.tags)
    }

    fn subject_read(&self) -> Option<bool> {
        None
    }

    fn subject_title(&self) -> Option<&str> {
        Some(&self.record.title)
    }

    fn subject_url(&self) -> Option<&str> {
        self.record.url.as_deref()
    }
}

impl Subject for ArticleRow {
    fn subject_id(&self) -> Option<RecordId> {
        Some(RecordId::Object(self.id))
    }

    fn subject_parent(&self) -> Option<RecordId> {
        self.feed.map(RecordId::Object)
    }

    fn subject_labels(&self) -> Option<&BTreeSet<String>> {
        Some(&self.record.flags)
    }

    fn subject_read(&self) -> Option<bool> {
        Some(self.record.read)
    }

    fn subject_title(&self) -> Option<&str> {
        Some(&self.record.title)
    }

    fn subject_url(&self) -> Option<&str> {
        self.record.link.as_deref()
    }
}

impl Subject for EnclosureRow {
    fn subject_id(&self) -> Option<RecordId> {
        Some(RecordId::Object(self.id))
    }

    fn subject_parent(&self) -> Option<RecordId> {
        self.article.map(RecordId::Object)
    }

    fn subject_labels(&self) -> Option<&BTreeSet<String>> {
        None
    }

    fn subject_read(&self) -> Option<bool> {
        None
    }

    fn subject_title(&self) -> Option<&str> {
        None
    }

    fn subject_url(&self) -> Option<&str> {
        Some(&self.record.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Predicate;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot_round_trips_graph() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("library.json");

        let store = ObjectStore::open(&path).await.unwrap();
        let mut feed = store.create_feed().await.unwrap();
        feed.set_title("Persisted");
        feed.add_tag("news");
        store.save_feed(&mut feed).await.unwrap();
        let mut a = store.create_article(Some(&feed)).await.unwrap();
        let mut b = store.create_article(Some(&feed)).await.unwrap();
        a.relate(&mut b).unwrap();
        store.save_article(&mut a).await.unwrap();
        drop(store);

        let reopened = ObjectStore::open(&path).await.unwrap();
        let feeds = reopened
            .entities_matching(&Query::feeds(Predicate::Tagged("news".into())), Window::all())
            .await
            .unwrap();
        assert_eq!(feeds.len(), 1);
        let Entity::Feed(loaded) = &feeds[0] else {
            panic!("expected a feed");
        };
        assert_eq!(loaded.title(), "Persisted");
        assert_eq!(loaded.articles().len().await.unwrap(), 2);

        let loaded_b = reopened
            .entities_matching(
                &Query::articles(Predicate::Id(b.id().unwrap().record())),
                Window::all(),
            )
            .await
            .unwrap();
        let Entity::Article(loaded_b) = &loaded_b[0] else {
            panic!("expected an article");
        };
        assert!(loaded_b.related().contains(&a.id().unwrap()));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("library.json");
        let store = ObjectStore::open(&path).await.unwrap();
        store.create_feed().await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("library.json")]);
    }

    #[tokio::test]
    async fn test_failed_snapshot_write_leaves_graph_unchanged() {
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join("store");
        let path = store_dir.join("library.json");
        let store = ObjectStore::open(&path).await.unwrap();
        let mut feed = store.create_feed().await.unwrap();
        feed.set_title("Before");
        store.save_feed(&mut feed).await.unwrap();

        // A regular file where the snapshot directory was makes every write fail.
        std::fs::remove_dir_all(&store_dir).unwrap();
        std::fs::write(&store_dir, b"not a directory").unwrap();

        assert!(store.create_feed().await.is_err());
        assert!(store.create_article(Some(&feed)).await.is_err());
        feed.set_title("After");
        assert!(store.save_feed(&mut feed).await.is_err());
        assert!(feed.is_dirty());
        assert!(store.delete_feed(feed.clone()).await.is_err());

        let feeds = store
            .entities_matching(&Query::feeds(Predicate::All), Window::all())
            .await
            .unwrap();
        assert_eq!(feeds.len(), 1);
        let Entity::Feed(stored) = &feeds[0] else {
            panic!("expected a feed");
        };
        assert_eq!(stored.title(), "Before");
        assert_eq!(
            store
                .count_matching(&Query::articles(Predicate::All))
                .await
                .unwrap(),
            0
        );

        // Once the directory is back the next write succeeds.
        std::fs::remove_file(&store_dir).unwrap();
        store.save_feed(&mut feed).await.unwrap();
        let reopened = ObjectStore::open(&path).await.unwrap();
        let feeds = reopened
            .entities_matching(&Query::feeds(Predicate::TitleContains("after".into())), Window::all())
            .await
            .unwrap();
        assert_eq!(feeds.len(), 1);
    }

    #[tokio::test]
    async fn test_row_ids_are_foreign() {
        let store = ObjectStore::in_memory();
        let foreign = Feed::hydrate(FeedId(RecordId::Row(1)), FeedRecord::default(), Default::default());
        let err = store.create_article(Some(&foreign)).await.unwrap_err();
        assert_eq!(err.kind, crate::storage::BackendErrorKind::NotFound);
    }
}
