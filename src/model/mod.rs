//! Feed / Article / Enclosure entities.
//!
//! Entities are plain values that wrap a persisted record together with a
//! backend identifier, a dirty bit and their relationships:
//!
//! - Parents own their children through a [`Collection`]: a [`Feed`] owns its
//!   articles, an [`Article`] owns its enclosures.
//! - Children point back with a typed identifier ([`FeedId`], [`ArticleId`]),
//!   never with a reference, so there are no ownership cycles.
//! - The related-articles relation is a symmetric set of [`ArticleId`]s kept on
//!   both endpoints.
//!
//! Every setter compares the old and new value and only marks the entity dirty
//! when they differ. Hydrated entities start clean.
//!
//! [`Collection`]: crate::storage::Collection

mod article;
mod enclosure;
mod feed;
mod ids;
mod record;

pub use article::{reparent_article, Article, ReleasedArticle};
pub use enclosure::{reparent_enclosure, Enclosure};
pub use feed::{wait_period_in_refreshes, Feed};
pub use ids::{ArticleId, EnclosureId, FeedId, RecordId};
pub use record::{ArticleRecord, EnclosureRecord, FeedRecord};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The operation links entities by identifier and one side was never stored.
    #[error("{0} has no backend identifier yet; save it first")]
    Unsaved(&'static str),

    /// Query feeds compute their articles and never carry a URL.
    #[error("query feeds cannot have a source URL")]
    QueryFeedUrl,
}

/// The three kinds of stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Feed,
    Article,
    Enclosure,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EntityKind::Feed => "feed",
            EntityKind::Article => "article",
            EntityKind::Enclosure => "enclosure",
        })
    }
}

/// A hydrated entity of any kind, as returned by a backend query.
#[derive(Debug, Clone)]
pub enum Entity {
    Feed(Feed),
    Article(Article),
    Enclosure(Enclosure),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Feed(_) => EntityKind::Feed,
            Entity::Article(_) => EntityKind::Article,
            Entity::Enclosure(_) => EntityKind::Enclosure,
        }
    }
}

/// Entity types that can be produced by a backend query.
pub trait Stored: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn from_entity(entity: Entity) -> Option<Self>;
}

impl Stored for Feed {
    const KIND: EntityKind = EntityKind::Feed;

    fn from_entity(entity: Entity) -> Option<Self> {
        match entity {
            Entity::Feed(feed) => Some(feed),
            _ => None,
        }
    }
}

impl Stored for Article {
    const KIND: EntityKind = EntityKind::Article;

    fn from_entity(entity: Entity) -> Option<Self> {
        match entity {
            Entity::Article(article) => Some(article),
            _ => None,
        }
    }
}

impl Stored for Enclosure {
    const KIND: EntityKind = EntityKind::Enclosure;

    fn from_entity(entity: Entity) -> Option<Self> {
        match entity {
            Entity::Enclosure(enclosure) => Some(enclosure),
            _ => None,
        }
    }
}

/// Assign `value` to `slot`, flagging `dirty` only on an actual change.
pub(crate) fn track<T: PartialEq>(slot: &mut T, value: T, dirty: &mut bool) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    *dirty = true;
    true
}
