//! Lazily loaded, index-addressable sequences.
//!
//! A [`Collection`] is either a plain in-memory vector or a view over a
//! backend query. Query views read fixed-size pages on demand and keep the
//! most recently used ones in an LRU cache; the total count is fetched once.
//! Only the in-memory form can be mutated; a query view has to be
//! [materialized](Collection::materialize) first.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, Stream, TryStreamExt};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use super::port::{BackendError, Query, StorageBackend, Window};
use crate::model::{Entity, EntityKind, Stored};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const DEFAULT_CACHED_PAGES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollectionError {
    #[error("collection is backed by a query; materialize it before mutating")]
    NotMaterialized,

    #[error("index {index} out of bounds for collection of length {len}")]
    OutOfBounds { index: usize, len: usize },

    #[error("backend returned a {found} where another kind was expected")]
    KindMismatch { found: EntityKind },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

type Convert<T> = Arc<dyn Fn(Entity) -> Option<T> + Send + Sync>;

pub struct Collection<T> {
    backing: Backing<T>,
}

enum Backing<T> {
    Local(Vec<T>),
    Query(Arc<View<T>>),
    Concat(Box<Collection<T>>, Box<Collection<T>>),
}

struct View<T> {
    query: Query,
    backend: Arc<dyn StorageBackend>,
    convert: Convert<T>,
    page_size: usize,
    cached_pages: NonZeroUsize,
    state: Mutex<ViewState<T>>,
}

struct ViewState<T> {
    len: Option<usize>,
    pages: LruCache<usize, Arc<[T]>>,
}

// ============================================================================
// Query views
// ============================================================================

impl<T> View<T> {
    fn new(
        query: Query,
        backend: Arc<dyn StorageBackend>,
        convert: Convert<T>,
        page_size: usize,
        cached_pages: NonZeroUsize,
    ) -> Self {
        Self {
            query,
            backend,
            convert,
            page_size: page_size.max(1),
            cached_pages,
            state: Mutex::new(ViewState {
                len: None,
                pages: LruCache::new(cached_pages),
            }),
        }
    }

    /// Same query, empty cache.
    fn fresh(&self) -> Self {
        Self::new(
            self.query.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.convert),
            self.page_size,
            self.cached_pages,
        )
    }

    async fn len(&self) -> Result<usize, CollectionError> {
        let mut state = self.state.lock().await;
        if let Some(len) = state.len {
            return Ok(len);
        }
        let len = self.backend.count_matching(&self.query).await?;
        state.len = Some(len);
        Ok(len)
    }

    /// Load (or reuse) the page containing `page * page_size`.
    ///
    /// The state lock is held across the fetch so concurrent misses on the
    /// same page wait for the first one instead of fetching again.
    async fn page(&self, page: usize) -> Result<Arc<[T]>, CollectionError> {
        let mut state = self.state.lock().await;
        if let Some(items) = state.pages.get(&page) {
            return Ok(Arc::clone(items));
        }

        let window = Window::new(page * self.page_size, self.page_size);
        tracing::trace!(
            backend = self.backend.name(),
            kind = %self.query.kind,
            page,
            "Fetching collection page"
        );
        let entities = self.backend.entities_matching(&self.query, window).await?;
        let items = entities
            .into_iter()
            .map(|entity| {
                let found = entity.kind();
                (self.convert)(entity).ok_or(CollectionError::KindMismatch { found })
            })
            .collect::<Result<Vec<T>, _>>()?;
        let items: Arc<[T]> = items.into();
        state.pages.put(page, Arc::clone(&items));
        Ok(items)
    }
}

impl<T: Clone> View<T> {
    async fn get(&self, index: usize) -> Result<T, CollectionError> {
        let len = self.len().await?;
        if index >= len {
            return Err(CollectionError::OutOfBounds { index, len });
        }
        let page = self.page(index / self.page_size).await?;
        page.get(index % self.page_size)
            .cloned()
            // The store shrank since the count was taken.
            .ok_or(CollectionError::OutOfBounds { index, len })
    }
}

// ============================================================================
// Construction
// ============================================================================

impl<T> Collection<T> {
    /// An empty in-memory collection.
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    pub fn from_vec(items: Vec<T>) -> Self {
        Self {
            backing: Backing::Local(items),
        }
    }

    /// A view over `query` that turns each returned entity into a `T`.
    pub fn backed<F>(query: Query, backend: Arc<dyn StorageBackend>, convert: F) -> Self
    where
        F: Fn(Entity) -> Option<T> + Send + Sync + 'static,
    {
        Self {
            backing: Backing::Query(Arc::new(View::new(
                query,
                backend,
                Arc::new(convert),
                DEFAULT_PAGE_SIZE,
                cache_capacity(DEFAULT_CACHED_PAGES),
            ))),
        }
    }

    /// Change the paging of a query view. Resets its cache.
    pub fn with_paging(self, page_size: usize, cached_pages: usize) -> Self {
        match self.backing {
            Backing::Query(view) => Self {
                backing: Backing::Query(Arc::new(View::new(
                    view.query.clone(),
                    Arc::clone(&view.backend),
                    Arc::clone(&view.convert),
                    page_size,
                    cache_capacity(cached_pages),
                ))),
            },
            Backing::Concat(left, right) => Self {
                backing: Backing::Concat(
                    Box::new(left.with_paging(page_size, cached_pages)),
                    Box::new(right.with_paging(page_size, cached_pages)),
                ),
            },
            local => Self { backing: local },
        }
    }

    pub fn with_page_size(self, page_size: usize) -> Self {
        self.with_paging(page_size, DEFAULT_CACHED_PAGES)
    }

    /// `true` when the elements live in memory and can be mutated.
    pub fn is_materialized(&self) -> bool {
        matches!(self.backing, Backing::Local(_))
    }

    pub fn as_slice(&self) -> Option<&[T]> {
        match &self.backing {
            Backing::Local(items) => Some(items),
            _ => None,
        }
    }

    /// The query behind a view, if any.
    pub fn query(&self) -> Option<&Query> {
        match &self.backing {
            Backing::Query(view) => Some(&view.query),
            _ => None,
        }
    }

    /// Append `other` after `self`.
    pub fn concat(self, other: Collection<T>) -> Collection<T> {
        match (self.backing, other.backing) {
            (Backing::Local(mut left), Backing::Local(right)) => {
                left.extend(right);
                Collection::from_vec(left)
            }
            (left, right) => Collection {
                backing: Backing::Concat(
                    Box::new(Collection { backing: left }),
                    Box::new(Collection { backing: right }),
                ),
            },
        }
    }

    /// Drop cached pages and counts so the next read hits the backend again.
    pub fn invalidate(&mut self) {
        match &mut self.backing {
            Backing::Local(_) => {}
            Backing::Query(view) => *view = Arc::new(view.fresh()),
            Backing::Concat(left, right) => {
                left.invalidate();
                right.invalidate();
            }
        }
    }

    fn local_mut(&mut self) -> Result<&mut Vec<T>, CollectionError> {
        match &mut self.backing {
            Backing::Local(items) => Ok(items),
            _ => Err(CollectionError::NotMaterialized),
        }
    }

    pub fn push(&mut self, item: T) -> Result<(), CollectionError> {
        self.local_mut()?.push(item);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<T, CollectionError> {
        let items = self.local_mut()?;
        if index >= items.len() {
            return Err(CollectionError::OutOfBounds {
                index,
                len: items.len(),
            });
        }
        Ok(items.remove(index))
    }

    pub fn retain<F>(&mut self, keep: F) -> Result<(), CollectionError>
    where
        F: FnMut(&T) -> bool,
    {
        self.local_mut()?.retain(keep);
        Ok(())
    }

    /// Record that `item` now belongs here. Views pick it up from the store
    /// on the next read.
    pub(crate) fn attach(&mut self, item: T) {
        match &mut self.backing {
            Backing::Local(items) => items.push(item),
            _ => self.invalidate(),
        }
    }
}

impl<T: PartialEq> Collection<T> {
    /// Remove the first element equal to `item`.
    pub fn remove_item(&mut self, item: &T) -> Result<bool, CollectionError> {
        let items = self.local_mut()?;
        match items.iter().position(|candidate| candidate == item) {
            Some(index) => {
                items.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Record that `item` no longer belongs here.
    pub(crate) fn detach(&mut self, item: &T) {
        match &mut self.backing {
            Backing::Local(items) => items.retain(|candidate| candidate != item),
            _ => self.invalidate(),
        }
    }

    /// Record that `item` was saved: replace the equal element or append it.
    pub(crate) fn sync_item(&mut self, item: T) {
        match &mut self.backing {
            Backing::Local(items) => match items.iter_mut().find(|candidate| **candidate == item) {
                Some(slot) => *slot = item,
                None => items.push(item),
            },
            _ => self.invalidate(),
        }
    }
}

impl<T: Stored> Collection<T> {
    /// A view over `query` for one of the stored entity types.
    pub fn of(query: Query, backend: Arc<dyn StorageBackend>) -> Self {
        Self::backed(query, backend, T::from_entity)
    }
}

fn cache_capacity(pages: usize) -> NonZeroUsize {
    NonZeroUsize::new(pages).unwrap_or(NonZeroUsize::MIN)
}

// ============================================================================
// Reads
// ============================================================================

impl<T: Clone + Send + Sync + 'static> Collection<T> {
    pub fn len(&self) -> BoxFuture<'_, Result<usize, CollectionError>> {
        async move {
            match &self.backing {
                Backing::Local(items) => Ok(items.len()),
                Backing::Query(view) => view.len().await,
                Backing::Concat(left, right) => Ok(left.len().await? + right.len().await?),
            }
        }
        .boxed()
    }

    pub async fn is_empty(&self) -> Result<bool, CollectionError> {
        Ok(self.len().await? == 0)
    }

    pub fn get(&self, index: usize) -> BoxFuture<'_, Result<T, CollectionError>> {
        async move {
            match &self.backing {
                Backing::Local(items) => items.get(index).cloned().ok_or(
                    CollectionError::OutOfBounds {
                        index,
                        len: items.len(),
                    },
                ),
                Backing::Query(view) => view.get(index).await,
                Backing::Concat(left, right) => {
                    let left_len = left.len().await?;
                    if index < left_len {
                        left.get(index).await
                    } else {
                        right.get(index - left_len).await.map_err(|e| match e {
                            CollectionError::OutOfBounds { index, len } => {
                                CollectionError::OutOfBounds {
                                    index: index + left_len,
                                    len: len + left_len,
                                }
                            }
                            other => other,
                        })
                    }
                }
            }
        }
        .boxed()
    }

    /// Iterate from the first element. Each call starts over.
    pub fn stream(&self) -> impl Stream<Item = Result<T, CollectionError>> + Send + '_ {
        stream::try_unfold(0usize, move |index| async move {
            if index >= self.len().await? {
                return Ok(None);
            }
            let item = self.get(index).await?;
            Ok(Some((item, index + 1)))
        })
    }

    pub async fn to_vec(&self) -> Result<Vec<T>, CollectionError> {
        if let Backing::Local(items) = &self.backing {
            return Ok(items.clone());
        }
        self.stream().try_collect().await
    }

    /// Load every element into memory so the collection can be mutated.
    pub async fn materialize(&mut self) -> Result<&mut Vec<T>, CollectionError> {
        if !self.is_materialized() {
            let items = self.to_vec().await?;
            self.backing = Backing::Local(items);
        }
        self.local_mut()
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Collection<T> {
    pub async fn index_of(&self, item: &T) -> Result<Option<usize>, CollectionError> {
        let mut elements = std::pin::pin!(self.stream());
        let mut index = 0;
        while let Some(candidate) = elements.try_next().await? {
            if candidate == *item {
                return Ok(Some(index));
            }
            index += 1;
        }
        Ok(None)
    }

    pub async fn contains(&self, item: &T) -> Result<bool, CollectionError> {
        Ok(self.index_of(item).await?.is_some())
    }

    /// Element-wise equality, regardless of how either side is backed.
    pub async fn sequence_eq(&self, other: &Collection<T>) -> Result<bool, CollectionError> {
        if self.len().await? != other.len().await? {
            return Ok(false);
        }
        let mut left = std::pin::pin!(self.stream());
        let mut right = std::pin::pin!(other.stream());
        while let Some(a) = left.try_next().await? {
            match right.try_next().await? {
                Some(b) if a == b => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Clone for Collection<T> {
    fn clone(&self) -> Self {
        let backing = match &self.backing {
            Backing::Local(items) => Backing::Local(items.clone()),
            Backing::Query(view) => Backing::Query(Arc::clone(view)),
            Backing::Concat(left, right) => Backing::Concat(left.clone(), right.clone()),
        };
        Self { backing }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.backing {
            Backing::Local(items) => f.debug_tuple("Collection::Local").field(items).finish(),
            Backing::Query(view) => f
                .debug_struct("Collection::Query")
                .field("backend", &view.backend.name())
                .field("query", &view.query)
                .field("page_size", &view.page_size)
                .finish(),
            Backing::Concat(left, right) => f
                .debug_tuple("Collection::Concat")
                .field(left)
                .field(right)
                .finish(),
        }
    }
}
