//! Persistence and synchronization core for a feed reader.
//!
//! - [`model`]: feeds, articles and enclosures with dirty tracking
//! - [`storage`]: the backend port, SQLite and object-graph backends, lazy
//!   collections and the [`Library`](storage::Library)
//! - [`feed`]: downloading, parsing and scheduled updates
//! - [`migrate`]: copying a library from one backend to another

pub mod config;
pub mod feed;
pub mod migrate;
pub mod model;
pub mod storage;
pub mod util;
