//! Remote updates: download, parse, apply, and optionally fetch the image.
//!
//! Per feed URL the service moves through `Fetching`, then possibly
//! `ImageFetching` under the image's URL, and back to idle. The in-flight map
//! is the only shared mutable state; its entries are owned by an RAII guard so
//! a failed, finished or dropped update always releases its URL.

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

use super::download::{DownloadError, Downloader};
use super::parser::FeedParser;
use crate::model::{Feed, FeedId};
use crate::storage::{ApplySummary, BackendError, Library};

pub const DEFAULT_REFRESH_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Fetching,
    ImageFetching,
}

/// How an update finished, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing to fetch: the feed has no URL or is a query feed.
    Skipped,
    /// Sat out this refresh because of earlier failures.
    Deferred { remaining: u32 },
    /// The document was applied. `image` is set when a feed image was
    /// downloaded as part of the update.
    Updated { summary: ApplySummary, image: bool },
    /// The feed URL served an image, which became the feed image.
    ImageUpdated,
    /// The payload was not a feed document.
    Unparseable,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("An update for {0} is already in progress")]
    AlreadyInFlight(String),

    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The document was applied but its image could not be fetched.
    #[error("Image download failed: {0}")]
    Image(DownloadError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl UpdateError {
    /// Whether this failure counts against the feed for backoff.
    pub fn is_offense(&self) -> bool {
        matches!(self, UpdateError::Download(_))
    }
}

/// Posted once per feed by [`UpdateService::refresh_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    pub feed: Option<FeedId>,
    pub title: String,
    pub outcome: Result<UpdateOutcome, String>,
}

/// Result of one feed in a refresh round.
#[derive(Debug)]
pub struct FeedRefresh {
    pub feed: Feed,
    pub result: Result<UpdateOutcome, UpdateError>,
}

// ============================================================================
// In-flight tracking
// ============================================================================

type InFlightMap = Mutex<HashMap<String, UpdatePhase>>;

fn lock(map: &InFlightMap) -> MutexGuard<'_, HashMap<String, UpdatePhase>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns one entry of the in-flight map until dropped.
struct InFlight<'a> {
    map: &'a InFlightMap,
    key: String,
}

impl<'a> InFlight<'a> {
    fn claim(map: &'a InFlightMap, key: &str, phase: UpdatePhase) -> Option<Self> {
        let mut entries = lock(map);
        if entries.contains_key(key) {
            return None;
        }
        entries.insert(key.to_string(), phase);
        Some(Self {
            map,
            key: key.to_string(),
        })
    }

    /// Move the entry to `key`. Fails, leaving the entry as is, when `key` is
    /// already claimed by someone else.
    fn rekey(&mut self, key: &str, phase: UpdatePhase) -> bool {
        let mut entries = lock(self.map);
        if key == self.key {
            entries.insert(key.to_string(), phase);
            return true;
        }
        if entries.contains_key(key) {
            return false;
        }
        entries.remove(&self.key);
        entries.insert(key.to_string(), phase);
        self.key = key.to_string();
        true
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.map).remove(&self.key);
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct UpdateService {
    library: Arc<Library>,
    downloader: Arc<dyn Downloader>,
    parser: Arc<dyn FeedParser>,
    concurrency: usize,
    in_flight: InFlightMap,
}

impl UpdateService {
    pub fn new(
        library: Arc<Library>,
        downloader: Arc<dyn Downloader>,
        parser: Arc<dyn FeedParser>,
    ) -> Self {
        Self {
            library,
            downloader,
            parser,
            concurrency: DEFAULT_REFRESH_CONCURRENCY,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    /// The in-flight state for `url`, if an update currently holds it.
    pub fn phase(&self, url: &str) -> Option<UpdatePhase> {
        lock(&self.in_flight).get(url).copied()
    }

    /// Fetch the feed's document and apply it.
    ///
    /// Backoff fields are left alone; [`refresh_all`](Self::refresh_all)
    /// applies the policy.
    pub async fn update_feed(&self, feed: &mut Feed) -> Result<UpdateOutcome, UpdateError> {
        if feed.is_query_feed() {
            return Ok(UpdateOutcome::Skipped);
        }
        let Some(url) = feed.url().map(str::to_string) else {
            return Ok(UpdateOutcome::Skipped);
        };
        let mut guard = InFlight::claim(&self.in_flight, &url, UpdatePhase::Fetching)
            .ok_or_else(|| UpdateError::AlreadyInFlight(url.clone()))?;

        let download = self.downloader.download(&url).await?;
        if download.is_image() {
            self.apply_image(feed, download.bytes).await?;
            return Ok(UpdateOutcome::ImageUpdated);
        }

        let parsed = match self.parser.parse(&download.bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(feed = %url, error = %e, "Unparseable feed payload");
                return Ok(UpdateOutcome::Unparseable);
            }
        };

        let summary = self.library.update_feed(feed, &parsed).await?;

        let mut image = false;
        let image_url = parsed
            .image_url
            .as_deref()
            .filter(|_| feed.image().is_none())
            .map(|image_url| resolve(&url, image_url));
        if let Some(image_url) = image_url {
            if guard.rekey(&image_url, UpdatePhase::ImageFetching) {
                let download = self
                    .downloader
                    .download(&image_url)
                    .await
                    .map_err(UpdateError::Image)?;
                if download.is_image() {
                    image = self.apply_image(feed, download.bytes).await?;
                } else {
                    tracing::debug!(
                        feed = %url,
                        image = %image_url,
                        mime = download.mime_type.as_deref().unwrap_or("unknown"),
                        "Feed image URL did not serve an image"
                    );
                }
            } else {
                tracing::debug!(feed = %url, image = %image_url, "Image already being fetched");
            }
        }
        drop(guard);

        Ok(UpdateOutcome::Updated { summary, image })
    }

    async fn apply_image(&self, feed: &mut Feed, bytes: Vec<u8>) -> Result<bool, BackendError> {
        if !feed.set_image(Some(bytes)) {
            return Ok(false);
        }
        self.library.backend().save_feed(feed).await?;
        Ok(true)
    }

    /// Run one refresh round over `feeds`.
    ///
    /// Feeds still waiting out earlier failures are counted down and skipped
    /// without a request. Download failures and unparseable payloads are
    /// offenses; any other completed update ends the offense streak. The
    /// backoff fields are saved for every feed, and one [`UpdateEvent`] per
    /// feed is posted to `events`. Results come back in completion order.
    pub async fn refresh_all(
        &self,
        feeds: Vec<Feed>,
        events: Option<mpsc::Sender<UpdateEvent>>,
    ) -> Vec<FeedRefresh> {
        let total = feeds.len();
        let results: Vec<FeedRefresh> = stream::iter(feeds)
            .map(|feed| {
                let events = events.clone();
                async move {
                    let refreshed = self.refresh_one(feed).await;
                    if let Some(events) = events {
                        let event = UpdateEvent {
                            feed: refreshed.feed.id(),
                            title: refreshed.feed.title().to_string(),
                            outcome: match &refreshed.result {
                                Ok(outcome) => Ok(*outcome),
                                Err(e) => Err(e.to_string()),
                            },
                        };
                        if events.send(event).await.is_err() {
                            tracing::debug!("Update event receiver dropped");
                        }
                    }
                    refreshed
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let failed = results.iter().filter(|r| r.result.is_err()).count();
        let deferred = results
            .iter()
            .filter(|r| matches!(r.result, Ok(UpdateOutcome::Deferred { .. })))
            .count();
        tracing::info!(total, failed, deferred, "Refresh round finished");
        results
    }

    async fn refresh_one(&self, mut feed: Feed) -> FeedRefresh {
        let result = if feed.is_query_feed() || feed.url().is_none() {
            Ok(UpdateOutcome::Skipped)
        } else if feed.count_down() {
            tracing::debug!(
                feed = %feed.url().unwrap_or_default(),
                remaining = feed.remaining_wait(),
                "Deferring update"
            );
            Ok(UpdateOutcome::Deferred {
                remaining: feed.remaining_wait(),
            })
        } else {
            let result = self.update_feed(&mut feed).await;
            match &result {
                Ok(UpdateOutcome::Unparseable) => feed.record_failure(),
                Err(e) if e.is_offense() => feed.record_failure(),
                Ok(_) | Err(UpdateError::Image(_)) => feed.record_success(),
                Err(_) => {}
            }
            if let Err(e) = &result {
                tracing::warn!(
                    feed = %feed.url().unwrap_or_default(),
                    error = %e,
                    offenses = feed.wait_period(),
                    "Feed update failed"
                );
            }
            result
        };

        if feed.is_dirty() {
            if let Err(e) = self.library.backend().save_feed(&mut feed).await {
                tracing::warn!(feed = %feed.title(), error = %e, "Failed to save backoff state");
            }
        }
        FeedRefresh { feed, result }
    }
}

/// Resolve a possibly relative image reference against the feed URL.
fn resolve(base: &str, reference: &str) -> String {
    url::Url::parse(base)
        .and_then(|base| base.join(reference))
        .map(String::from)
        .unwrap_or_else(|_| reference.to_string())
}
