use std::hash::{Hash, Hasher};

use super::ids::{ArticleId, EnclosureId};
use super::record::EnclosureRecord;
use super::{track, Article};

/// A media attachment on an article.
#[derive(Debug, Clone)]
pub struct Enclosure {
    id: Option<EnclosureId>,
    article: Option<ArticleId>,
    record: EnclosureRecord,
    dirty: bool,
}

impl Enclosure {
    pub fn new(url: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: None,
            article: None,
            record: EnclosureRecord {
                url: url.into(),
                kind: kind.into(),
            },
            dirty: false,
        }
    }

    pub fn hydrate(id: EnclosureId, article: Option<ArticleId>, record: EnclosureRecord) -> Self {
        Self {
            id: Some(id),
            article,
            record,
            dirty: false,
        }
    }

    pub fn id(&self) -> Option<EnclosureId> {
        self.id
    }

    pub fn article(&self) -> Option<ArticleId> {
        self.article
    }

    pub fn record(&self) -> &EnclosureRecord {
        &self.record
    }

    pub fn url(&self) -> &str {
        &self.record.url
    }

    /// MIME type as announced by the feed.
    pub fn kind(&self) -> &str {
        &self.record.kind
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn set_url(&mut self, url: impl Into<String>) -> bool {
        track(&mut self.record.url, url.into(), &mut self.dirty)
    }

    pub fn set_kind(&mut self, kind: impl Into<String>) -> bool {
        track(&mut self.record.kind, kind.into(), &mut self.dirty)
    }

    pub(crate) fn set_article(&mut self, article: Option<ArticleId>) -> bool {
        track(&mut self.article, article, &mut self.dirty)
    }

    pub fn same_content(&self, other: &Enclosure) -> bool {
        self.record == other.record
    }
}

/// Move `enclosure` under `to`, taking it out of `from`.
pub fn reparent_enclosure(enclosure: &mut Enclosure, from: Option<&mut Article>, to: &mut Article) {
    if let Some(from) = from {
        from.enclosures_mut().detach(enclosure);
    }
    to.enclosures_mut().detach(enclosure);
    enclosure.set_article(to.id());
    to.enclosures_mut().attach(enclosure.clone());
}

impl PartialEq for Enclosure {
    fn eq(&self, other: &Self) -> bool {
        match (self.id, other.id) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.record == other.record,
            _ => false,
        }
    }
}

impl Eq for Enclosure {}

impl Hash for Enclosure {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.id {
            Some(id) => {
                0u8.hash(state);
                id.hash(state);
            }
            None => {
                1u8.hash(state);
                self.record.hash(state);
            }
        }
    }
}
