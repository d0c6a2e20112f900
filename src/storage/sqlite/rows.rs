use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::FromRow;
use std::collections::BTreeSet;

use crate::model::{
    ArticleId, ArticleRecord, EnclosureId, EnclosureRecord, FeedId, FeedRecord, RecordId,
};
use crate::storage::BackendError;

// ============================================================================
// Column lists
// ============================================================================

pub(super) const FEED_COLUMNS: &str = "feeds.id, feeds.title, feeds.url, feeds.summary, \
     feeds.query, feeds.wait_period, feeds.remaining_wait, feeds.image, \
     (SELECT json_group_array(t.tag) FROM feed_tags t WHERE t.feed_id = feeds.id) AS tags";

pub(super) const ARTICLE_COLUMNS: &str = "articles.id, articles.feed_id, articles.title, \
     articles.link, articles.summary, articles.author, articles.published, articles.updated, \
     articles.content, articles.read, articles.reading_time, \
     (SELECT json_group_array(f.flag) FROM article_flags f WHERE f.article_id = articles.id) AS flags, \
     (SELECT json_group_array(CASE WHEN r.a = articles.id THEN r.b ELSE r.a END) \
        FROM related_articles r WHERE r.a = articles.id OR r.b = articles.id) AS related";

pub(super) const ENCLOSURE_COLUMNS: &str =
    "enclosures.id, enclosures.article_id, enclosures.url, enclosures.kind";

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, FromRow)]
pub(super) struct FeedRow {
    pub id: i64,
    pub title: String,
    pub url: Option<String>,
    pub summary: String,
    pub query: Option<String>,
    pub wait_period: i64,
    pub remaining_wait: i64,
    pub image: Option<Vec<u8>>,
    pub tags: String,
}

impl FeedRow {
    pub fn into_parts(self) -> Result<(FeedId, FeedRecord), BackendError> {
        let record = FeedRecord {
            title: self.title,
            url: self.url,
            summary: self.summary,
            query: self.query,
            tags: decode_json(&self.tags)?,
            wait_period: to_u32(self.wait_period),
            remaining_wait: to_u32(self.remaining_wait),
            image: self.image,
        };
        Ok((FeedId(RecordId::Row(self.id)), record))
    }
}

#[derive(Debug, FromRow)]
pub(super) struct ArticleRow {
    pub id: i64,
    pub feed_id: Option<i64>,
    pub title: String,
    pub link: Option<String>,
    pub summary: String,
    pub author: String,
    pub published: Option<String>,
    pub updated: Option<String>,
    pub content: String,
    pub read: bool,
    pub reading_time: f64,
    pub flags: String,
    pub related: String,
}

pub(super) struct ArticleParts {
    pub id: ArticleId,
    pub feed: Option<FeedId>,
    pub record: ArticleRecord,
    pub related: BTreeSet<ArticleId>,
}

impl ArticleRow {
    pub fn into_parts(self) -> Result<ArticleParts, BackendError> {
        let related: BTreeSet<i64> = decode_json(&self.related)?;
        let record = ArticleRecord {
            title: self.title,
            link: self.link,
            summary: self.summary,
            author: self.author,
            published: decode_time(self.published.as_deref())?,
            updated: decode_time(self.updated.as_deref())?,
            content: self.content,
            read: self.read,
            estimated_reading_time: self.reading_time,
            flags: decode_json(&self.flags)?,
        };
        Ok(ArticleParts {
            id: ArticleId(RecordId::Row(self.id)),
            feed: self.feed_id.map(|id| FeedId(RecordId::Row(id))),
            record,
            related: related
                .into_iter()
                .map(|id| ArticleId(RecordId::Row(id)))
                .collect(),
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct EnclosureRow {
    pub id: i64,
    pub article_id: Option<i64>,
    pub url: String,
    pub kind: String,
}

impl EnclosureRow {
    pub fn into_parts(self) -> (EnclosureId, Option<ArticleId>, EnclosureRecord) {
        (
            EnclosureId(RecordId::Row(self.id)),
            self.article_id.map(|id| ArticleId(RecordId::Row(id))),
            EnclosureRecord {
                url: self.url,
                kind: self.kind,
            },
        )
    }
}

// ============================================================================
// Encoding helpers
// ============================================================================

/// Timestamps are stored as RFC 3339 text with full sub-second precision so
/// values survive a round trip unchanged.
pub(super) fn encode_time(time: Option<DateTime<Utc>>) -> Option<String> {
    time.map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn decode_time(text: Option<&str>) -> Result<Option<DateTime<Utc>>, BackendError> {
    text.map(|t| {
        DateTime::parse_from_rfc3339(t)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| BackendError::unknown(format!("bad timestamp '{t}': {e}")))
    })
    .transpose()
}

fn decode_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, BackendError> {
    serde_json::from_str(text).map_err(BackendError::from)
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

pub(super) fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
