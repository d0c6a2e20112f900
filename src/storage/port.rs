use async_trait::async_trait;
use thiserror::Error;

use super::predicate::Predicate;
use crate::model::{Article, Enclosure, Entity, EntityKind, Feed};

// ============================================================================
// Errors
// ============================================================================

/// Closed classification of backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BackendErrorKind {
    /// The row does not exist (never stored, or already deleted).
    #[error("not found")]
    NotFound,

    /// The store refused or could not complete a write.
    #[error("write failure")]
    WriteFailure,

    #[error("unknown backend error")]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::NotFound, message)
    }

    pub fn write_failure(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::WriteFailure, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Unknown, message)
    }

    pub(crate) fn unsaved(kind: EntityKind) -> Self {
        Self::not_found(format!("{kind} was never stored"))
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::write_failure(err.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::unknown(err.to_string())
    }
}

// ============================================================================
// Queries
// ============================================================================

/// A predicate restricted to one entity kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub kind: EntityKind,
    pub predicate: Predicate,
}

impl Query {
    pub fn new(kind: EntityKind, predicate: Predicate) -> Self {
        Self { kind, predicate }
    }

    pub fn feeds(predicate: Predicate) -> Self {
        Self::new(EntityKind::Feed, predicate)
    }

    pub fn articles(predicate: Predicate) -> Self {
        Self::new(EntityKind::Article, predicate)
    }

    pub fn enclosures(predicate: Predicate) -> Self {
        Self::new(EntityKind::Enclosure, predicate)
    }
}

/// A page of results in store order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub offset: usize,
    pub limit: usize,
}

impl Window {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// Everything from the first row on.
    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: usize::MAX,
        }
    }
}

// ============================================================================
// Port
// ============================================================================

/// The contract every storage backend satisfies.
///
/// Created entities are already stored and carry an identifier. Saves write
/// the current in-memory field values and clear the dirty bit; deletes consume
/// the entity and cascade to everything the row owns. Results come back in
/// store order, which is insertion order for both shipped backends.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    async fn create_feed(&self) -> Result<Feed, BackendError>;

    /// Allocate an article, parented to `feed` unless it is a query feed.
    async fn create_article(&self, feed: Option<&Feed>) -> Result<Article, BackendError>;

    async fn create_enclosure(&self, article: Option<&Article>) -> Result<Enclosure, BackendError>;

    async fn count_matching(&self, query: &Query) -> Result<usize, BackendError>;

    async fn entities_matching(
        &self,
        query: &Query,
        window: Window,
    ) -> Result<Vec<Entity>, BackendError>;

    async fn save_feed(&self, feed: &mut Feed) -> Result<(), BackendError>;

    async fn save_article(&self, article: &mut Article) -> Result<(), BackendError>;

    async fn save_enclosure(&self, enclosure: &mut Enclosure) -> Result<(), BackendError>;

    async fn delete_feed(&self, feed: Feed) -> Result<(), BackendError>;

    async fn delete_article(&self, article: Article) -> Result<(), BackendError>;

    async fn delete_enclosure(&self, enclosure: Enclosure) -> Result<(), BackendError>;
}
