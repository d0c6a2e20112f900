//! Remote side of feed handling.
//!
//! - [`parser`] turns downloaded bytes into a backend-neutral document (`feed-rs`)
//! - [`download`] fetches bytes over HTTP with a timeout and size cap (`reqwest`)
//! - [`update`] drives downloads, applies documents through the
//!   [`Library`](crate::storage::Library) and runs refresh rounds with backoff
//!
//! # Example
//!
//! ```ignore
//! let service = UpdateService::new(library, downloader, Arc::new(FeedRsParser));
//! let results = service.refresh_all(feeds, Some(event_tx)).await;
//! ```

mod download;
mod parser;
mod update;

pub use download::{
    Download, DownloadError, Downloader, ReqwestDownloader, DEFAULT_MAX_BYTES, DEFAULT_TIMEOUT,
};
pub use parser::{FeedParser, FeedRsParser, ParseError, ParsedEnclosure, ParsedFeed, ParsedItem};
pub use update::{
    FeedRefresh, UpdateError, UpdateEvent, UpdateOutcome, UpdatePhase, UpdateService,
    DEFAULT_REFRESH_CONCURRENCY,
};
