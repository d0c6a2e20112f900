//! One-shot copy of a whole object graph between two storage backends.
//!
//! Runs in phases: feeds, then articles, then related-article edges, then
//! enclosures. Creations within a phase run concurrently and each phase is
//! joined before the next one starts, so every child is created after the
//! parent it resolves to.
//!
//! Source entities that already have an equal counterpart in the destination
//! are skipped and mapped onto that counterpart. Within one store this means
//! the same identifier; across stores it means equal persisted content under
//! the same (mapped) parent. Running a migration twice therefore creates
//! nothing the second time.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

use crate::model::{Article, ArticleId, Enclosure, EntityKind, Feed, FeedId, Stored};
use crate::storage::{BackendError, Predicate, Query, StorageBackend, Window};
use crate::util::estimate_reading_time;

pub const DEFAULT_MIGRATION_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Failed to load {kind}s from the {backend} store: {source}")]
    Load {
        kind: EntityKind,
        backend: &'static str,
        source: BackendError,
    },
}

/// One source entity that could not be copied.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationFailure {
    pub kind: EntityKind,
    /// Identifier of the entity in the source store.
    pub source_id: String,
    pub error: BackendError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationReport {
    pub feeds_created: usize,
    pub feeds_skipped: usize,
    pub articles_created: usize,
    pub articles_skipped: usize,
    pub enclosures_created: usize,
    pub enclosures_skipped: usize,
    /// Related-article edges added in the destination.
    pub related_edges: usize,
    pub failures: Vec<MigrationFailure>,
}

impl MigrationReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, kind: EntityKind, source_id: impl ToString, error: BackendError) {
        let source_id = source_id.to_string();
        tracing::warn!(kind = %kind, source = %source_id, error = %error, "Failed to migrate entity");
        self.failures.push(MigrationFailure {
            kind,
            source_id,
            error,
        });
    }
}

/// Copies everything from `source` into `destination`.
pub struct Migrator {
    source: Arc<dyn StorageBackend>,
    destination: Arc<dyn StorageBackend>,
    concurrency: usize,
}

/// Source entity paired with its destination counterpart, if it has one yet.
struct Planned<T> {
    source: T,
    existing: Option<T>,
}

impl Migrator {
    pub fn new(source: Arc<dyn StorageBackend>, destination: Arc<dyn StorageBackend>) -> Self {
        Self {
            source,
            destination,
            concurrency: DEFAULT_MIGRATION_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run every phase and report what happened.
    ///
    /// Only a failure to read either store aborts the run; per-entity create
    /// failures are collected in [`MigrationReport::failures`] and their
    /// children are reported as failed too.
    pub async fn run(&self) -> Result<MigrationReport, MigrationError> {
        tracing::info!(
            from = self.source.name(),
            to = self.destination.name(),
            "Starting migration"
        );
        let mut report = MigrationReport::default();

        let feeds = self.migrate_feeds(&mut report).await?;
        let (articles, edges) = self.migrate_articles(&feeds, &mut report).await?;
        self.migrate_related(&articles, &edges, &mut report).await;
        self.migrate_enclosures(&articles, &mut report).await?;

        tracing::info!(
            feeds = report.feeds_created,
            articles = report.articles_created,
            enclosures = report.enclosures_created,
            related = report.related_edges,
            skipped = report.feeds_skipped + report.articles_skipped + report.enclosures_skipped,
            failures = report.failures.len(),
            "Migration finished"
        );
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------------

    async fn migrate_feeds(
        &self,
        report: &mut MigrationReport,
    ) -> Result<HashMap<FeedId, Feed>, MigrationError> {
        let source: Vec<Feed> = load(self.source.as_ref()).await?;
        let destination: Vec<Feed> = load(self.destination.as_ref()).await?;
        let plan = pair(source, destination, |s, d| s == d || s.same_content(d));

        let results: Vec<(Option<FeedId>, Result<(Feed, bool), BackendError>)> = stream::iter(plan)
            .map(|planned| async move {
                let id = planned.source.id();
                let result = match planned.existing {
                    Some(existing) => Ok((existing, false)),
                    None => self.copy_feed(&planned.source).await.map(|feed| (feed, true)),
                };
                (id, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut map = HashMap::new();
        for (id, result) in results {
            match result {
                Ok((feed, created)) => {
                    if created {
                        report.feeds_created += 1;
                    } else {
                        report.feeds_skipped += 1;
                    }
                    if let Some(id) = id {
                        map.insert(id, feed);
                    }
                }
                Err(e) => report.fail(EntityKind::Feed, display_id(id), e),
            }
        }
        Ok(map)
    }

    async fn migrate_articles(
        &self,
        feeds: &HashMap<FeedId, Feed>,
        report: &mut MigrationReport,
    ) -> Result<(HashMap<ArticleId, Article>, BTreeSet<(ArticleId, ArticleId)>), MigrationError> {
        let source: Vec<Article> = load(self.source.as_ref()).await?;
        let edges: BTreeSet<(ArticleId, ArticleId)> = source
            .iter()
            .filter_map(|article| Some((article.id()?, article.related())))
            .flat_map(|(id, related)| related.iter().map(move |&other| (id.min(other), id.max(other))))
            .collect();
        let destination: Vec<Article> = load(self.destination.as_ref()).await?;

        // Articles whose parent did not make it cannot be placed.
        let (placeable, orphaned): (Vec<Article>, Vec<Article>) = source
            .into_iter()
            .partition(|article| article.feed().map_or(true, |feed| feeds.contains_key(&feed)));
        for article in orphaned {
            report.fail(
                EntityKind::Article,
                display_id(article.id()),
                BackendError::not_found("parent feed was not migrated"),
            );
        }

        let parent_of = |article: &Article| article.feed().and_then(|feed| feeds.get(&feed));
        let plan = pair(placeable, destination, |s, d| {
            s == d || (s.same_content(d) && d.feed() == parent_of(s).and_then(Feed::id))
        });

        let results: Vec<(Option<ArticleId>, Result<(Article, bool), BackendError>)> =
            stream::iter(plan)
                .map(|planned| async move {
                    let id = planned.source.id();
                    let result = match planned.existing {
                        Some(existing) => Ok((existing, false)),
                        None => self
                            .copy_article(&planned.source, parent_of(&planned.source))
                            .await
                            .map(|article| (article, true)),
                    };
                    (id, result)
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let mut map = HashMap::new();
        for (id, result) in results {
            match result {
                Ok((article, created)) => {
                    if created {
                        report.articles_created += 1;
                    } else {
                        report.articles_skipped += 1;
                    }
                    if let Some(id) = id {
                        map.insert(id, article);
                    }
                }
                Err(e) => report.fail(EntityKind::Article, display_id(id), e),
            }
        }
        Ok((map, edges))
    }

    /// Rebuild the related relation among migrated articles.
    ///
    /// Every destination article gaining an edge is saved with its complete
    /// relation, so concurrent saves of both endpoints agree.
    async fn migrate_related(
        &self,
        articles: &HashMap<ArticleId, Article>,
        edges: &BTreeSet<(ArticleId, ArticleId)>,
        report: &mut MigrationReport,
    ) {
        let mut added: BTreeSet<(ArticleId, ArticleId)> = BTreeSet::new();
        let mut gained: HashMap<ArticleId, BTreeSet<ArticleId>> = HashMap::new();
        for (a, b) in edges {
            let (Some(a), Some(b)) = (articles.get(a), articles.get(b)) else {
                continue;
            };
            let (Some(a_id), Some(b_id)) = (a.id(), b.id()) else {
                continue;
            };
            if a_id == b_id || a.related().contains(&b_id) {
                continue;
            }
            if added.insert((a_id.min(b_id), a_id.max(b_id))) {
                gained.entry(a_id).or_default().insert(b_id);
                gained.entry(b_id).or_default().insert(a_id);
            }
        }
        if added.is_empty() {
            return;
        }

        let jobs: Vec<(Article, BTreeSet<ArticleId>)> = articles
            .values()
            .filter_map(|article| {
                let extra = gained.remove(&article.id()?)?;
                Some((article.clone(), extra))
            })
            .collect();

        let results: Vec<(Option<ArticleId>, Result<(), BackendError>)> = stream::iter(jobs)
            .map(|(mut article, extra)| async move {
                let mut related = article.related().clone();
                related.extend(extra);
                article.set_related(related);
                let result = self.destination.save_article(&mut article).await;
                (article.id(), result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut failed: BTreeSet<ArticleId> = BTreeSet::new();
        for (id, result) in results {
            if let Err(e) = result {
                failed.extend(id);
                report.fail(EntityKind::Article, display_id(id), e);
            }
        }
        report.related_edges += added
            .iter()
            .filter(|(a, b)| !failed.contains(a) && !failed.contains(b))
            .count();
    }

    async fn migrate_enclosures(
        &self,
        articles: &HashMap<ArticleId, Article>,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        let source: Vec<Enclosure> = load(self.source.as_ref()).await?;
        let destination: Vec<Enclosure> = load(self.destination.as_ref()).await?;

        let (placeable, orphaned): (Vec<Enclosure>, Vec<Enclosure>) = source
            .into_iter()
            .partition(|enclosure| {
                enclosure
                    .article()
                    .map_or(true, |article| articles.contains_key(&article))
            });
        for enclosure in orphaned {
            report.fail(
                EntityKind::Enclosure,
                display_id(enclosure.id()),
                BackendError::not_found("parent article was not migrated"),
            );
        }

        let parent_of =
            |enclosure: &Enclosure| enclosure.article().and_then(|article| articles.get(&article));
        let plan = pair(placeable, destination, |s, d| {
            s == d || (s.same_content(d) && d.article() == parent_of(s).and_then(Article::id))
        });

        let results: Vec<(String, Result<bool, BackendError>)> = stream::iter(plan)
            .map(|planned| async move {
                let id = display_id(planned.source.id());
                let result = match planned.existing {
                    Some(_) => Ok(false),
                    None => self
                        .copy_enclosure(&planned.source, parent_of(&planned.source))
                        .await
                        .map(|()| true),
                };
                (id, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (id, result) in results {
            match result {
                Ok(true) => report.enclosures_created += 1,
                Ok(false) => report.enclosures_skipped += 1,
                Err(e) => report.fail(EntityKind::Enclosure, id, e),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Copies
    // ------------------------------------------------------------------------

    async fn copy_feed(&self, source: &Feed) -> Result<Feed, BackendError> {
        let mut feed = self.destination.create_feed().await?;
        let record = source.record();
        feed.set_title(record.title.as_str());
        feed.set_summary(record.summary.as_str());
        match &record.query {
            Some(query) => {
                feed.set_query(Some(query.clone()));
            }
            None => {
                feed.set_url(record.url.clone())
                    .map_err(|e| BackendError::write_failure(e.to_string()))?;
            }
        }
        feed.set_tags(record.tags.iter().cloned());
        feed.set_wait_period(record.wait_period);
        feed.set_remaining_wait(record.remaining_wait);
        feed.set_image(record.image.clone());
        self.destination.save_feed(&mut feed).await?;
        Ok(feed)
    }

    async fn copy_article(&self, source: &Article, parent: Option<&Feed>) -> Result<Article, BackendError> {
        let mut article = self.destination.create_article(parent).await?;
        let record = source.record();
        article.set_title(record.title.as_str());
        article.set_link(record.link.clone());
        article.set_summary(record.summary.as_str());
        article.set_author(record.author.as_str());
        article.set_published(record.published);
        article.set_updated(record.updated);
        article.set_content(record.content.as_str());
        article.set_read(record.read);
        let minutes = if record.estimated_reading_time > 0.0 {
            record.estimated_reading_time
        } else {
            estimate_reading_time(&record.content)
        };
        article.set_estimated_reading_time(minutes);
        article.set_flags(record.flags.iter().cloned());
        self.destination.save_article(&mut article).await?;
        Ok(article)
    }

    async fn copy_enclosure(&self, source: &Enclosure, parent: Option<&Article>) -> Result<(), BackendError> {
        let mut enclosure = self.destination.create_enclosure(parent).await?;
        enclosure.set_url(source.url());
        enclosure.set_kind(source.kind());
        self.destination.save_enclosure(&mut enclosure).await
    }
}

/// Every stored entity of one kind, in store order.
async fn load<T: Stored>(backend: &dyn StorageBackend) -> Result<Vec<T>, MigrationError> {
    let entities = backend
        .entities_matching(&Query::new(T::KIND, Predicate::All), Window::all())
        .await
        .map_err(|source| MigrationError::Load {
            kind: T::KIND,
            backend: backend.name(),
            source,
        })?;
    Ok(entities.into_iter().filter_map(T::from_entity).collect())
}

/// Pair each source entity with the first unclaimed destination entity that
/// `matches` it.
fn pair<T>(source: Vec<T>, destination: Vec<T>, matches: impl Fn(&T, &T) -> bool) -> Vec<Planned<T>> {
    let mut candidates: Vec<Option<T>> = destination.into_iter().map(Some).collect();
    source
        .into_iter()
        .map(|source| {
            let existing = candidates
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|candidate| matches(&source, candidate)))
                .and_then(Option::take);
            Planned { source, existing }
        })
        .collect()
}

fn display_id<I: ToString>(id: Option<I>) -> String {
    id.map(|id| id.to_string()).unwrap_or_else(|| "unsaved".to_string())
}
