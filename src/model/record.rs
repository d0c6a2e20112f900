//! Persisted field sets.
//!
//! A record is exactly what a backend writes for one row, minus identifiers
//! and parent pointers. Entities wrap a record together with their identity,
//! relationships and dirty bit.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedRecord {
    pub title: String,
    pub url: Option<String>,
    pub summary: String,
    pub query: Option<String>,
    pub tags: BTreeSet<String>,
    pub wait_period: u32,
    pub remaining_wait: u32,
    pub image: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArticleRecord {
    pub title: String,
    pub link: Option<String>,
    pub summary: String,
    pub author: String,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub content: String,
    pub read: bool,
    /// Minutes. Never NaN: setters normalise non-finite values to 0.
    pub estimated_reading_time: f64,
    pub flags: BTreeSet<String>,
}

impl ArticleRecord {
    /// Field-by-field comparison that ignores the derived reading time.
    pub fn same_content(&self, other: &ArticleRecord) -> bool {
        self.title == other.title
            && self.link == other.link
            && self.summary == other.summary
            && self.author == other.author
            && self.published == other.published
            && self.updated == other.updated
            && self.content == other.content
            && self.read == other.read
            && self.flags == other.flags
    }
}

impl Eq for ArticleRecord {}

// Reading time is left out: equal records always agree on every hashed field.
impl Hash for ArticleRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.title.hash(state);
        self.link.hash(state);
        self.summary.hash(state);
        self.author.hash(state);
        self.published.hash(state);
        self.updated.hash(state);
        self.content.hash(state);
        self.read.hash(state);
        self.flags.hash(state);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclosureRecord {
    pub url: String,
    pub kind: String,
}
