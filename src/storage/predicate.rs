//! Typed predicates over stored entities.
//!
//! Every backend evaluates the same semantics: the object store walks its rows
//! through [`Subject`], the SQLite store compiles the tree to a `WHERE` clause.
//! Terms that make no sense for a kind (e.g. `Unread` on a feed) match nothing.
//!
//! Text matching is ASCII case-insensitive on both sides, which is exactly what
//! SQLite's `lower()` does.

use std::collections::BTreeSet;
use thiserror::Error;

use crate::model::{Article, Enclosure, Feed, RecordId};

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All,
    /// The entity's own identifier.
    Id(RecordId),
    /// Owning feed (articles) or owning article (enclosures).
    Parent(RecordId),
    /// Feed tag or article flag.
    Tagged(String),
    Unread,
    Read,
    TitleContains(String),
    /// Feed URL, article link or enclosure URL.
    UrlEquals(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("term '{0}' is missing a value")]
    MissingValue(String),

    #[error("empty alternative in query expression")]
    EmptyAlternative,
}

/// Field accessors a predicate is evaluated against.
pub trait Subject {
    fn subject_id(&self) -> Option<RecordId>;
    fn subject_parent(&self) -> Option<RecordId>;
    fn subject_labels(&self) -> Option<&BTreeSet<String>>;
    fn subject_read(&self) -> Option<bool>;
    fn subject_title(&self) -> Option<&str>;
    fn subject_url(&self) -> Option<&str>;
}

impl Predicate {
    pub fn and(self, other: Predicate) -> Predicate {
        match (self, other) {
            (Predicate::All, p) | (p, Predicate::All) => p,
            (Predicate::And(mut left), Predicate::And(right)) => {
                left.extend(right);
                Predicate::And(left)
            }
            (Predicate::And(mut left), p) => {
                left.push(p);
                Predicate::And(left)
            }
            (p, q) => Predicate::And(vec![p, q]),
        }
    }

    pub fn negate(self) -> Predicate {
        match self {
            Predicate::Not(inner) => *inner,
            p => Predicate::Not(Box::new(p)),
        }
    }

    pub fn matches<S: Subject + ?Sized>(&self, subject: &S) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Id(id) => subject.subject_id() == Some(*id),
            Predicate::Parent(id) => subject.subject_parent() == Some(*id),
            Predicate::Tagged(tag) => subject
                .subject_labels()
                .is_some_and(|labels| labels.contains(tag)),
            Predicate::Unread => subject.subject_read() == Some(false),
            Predicate::Read => subject.subject_read() == Some(true),
            Predicate::TitleContains(needle) => subject
                .subject_title()
                .is_some_and(|title| contains_ignore_ascii_case(title, needle)),
            Predicate::UrlEquals(url) => subject.subject_url() == Some(url.as_str()),
            Predicate::And(terms) => terms.iter().all(|p| p.matches(subject)),
            Predicate::Or(terms) => terms.iter().any(|p| p.matches(subject)),
            Predicate::Not(inner) => !inner.matches(subject),
        }
    }

    /// Parse a query-feed expression.
    ///
    /// Whitespace-separated terms are AND-ed and `|` separates alternatives:
    /// `unread flag:starred | title:rust -link:https://spam.example`.
    /// Recognised terms are `unread`, `read`, `flag:<x>`, `title:<x>`,
    /// `link:<x>`, and bare words (title match). A leading `-` negates a term.
    /// An empty expression matches everything.
    pub fn parse_expression(text: &str) -> Result<Predicate, ExpressionError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Predicate::All);
        }

        let mut alternatives = Vec::new();
        for group in text.split('|') {
            let terms = group
                .split_whitespace()
                .map(parse_term)
                .collect::<Result<Vec<_>, _>>()?;
            let conjunction = match terms.len() {
                0 => return Err(ExpressionError::EmptyAlternative),
                1 => terms.into_iter().next().unwrap_or(Predicate::All),
                _ => Predicate::And(terms),
            };
            alternatives.push(conjunction);
        }

        Ok(if alternatives.len() == 1 {
            alternatives.pop().unwrap_or(Predicate::All)
        } else {
            Predicate::Or(alternatives)
        })
    }
}

fn parse_term(raw: &str) -> Result<Predicate, ExpressionError> {
    let (negated, term) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    if term.is_empty() {
        return Err(ExpressionError::MissingValue(raw.to_string()));
    }

    let predicate = match term.split_once(':') {
        Some((key @ ("flag" | "title" | "link"), value)) => {
            if value.is_empty() {
                return Err(ExpressionError::MissingValue(raw.to_string()));
            }
            match key {
                "flag" => Predicate::Tagged(value.to_string()),
                "title" => Predicate::TitleContains(value.to_string()),
                _ => Predicate::UrlEquals(value.to_string()),
            }
        }
        _ if term.eq_ignore_ascii_case("unread") => Predicate::Unread,
        _ if term.eq_ignore_ascii_case("read") => Predicate::Read,
        _ => Predicate::TitleContains(term.to_string()),
    };

    Ok(if negated {
        predicate.negate()
    } else {
        predicate
    })
}

pub(crate) fn contains_ignore_ascii_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

// ============================================================================
// Subjects
// ============================================================================

impl Subject for Feed {
    fn subject_id(&self) -> Option<RecordId> {
        self.id().map(|id| id.record())
    }

    fn subject_parent(&self) -> Option<RecordId> {
        None
    }

    fn subject_labels(&self) -> Option<&BTreeSet<String>> {
        Some(self.tags())
    }

    fn subject_read(&self) -> Option<bool> {
        None
    }

    fn subject_title(&self) -> Option<&str> {
        Some(self.title())
    }

    fn subject_url(&self) -> Option<&str> {
        self.url()
    }
}

impl Subject for Article {
    fn subject_id(&self) -> Option<RecordId> {
        self.id().map(|id| id.record())
    }

    fn subject_parent(&self) -> Option<RecordId> {
        self.feed().map(|id| id.record())
    }

    fn subject_labels(&self) -> Option<&BTreeSet<String>> {
        Some(self.flags())
    }

    fn subject_read(&self) -> Option<bool> {
        Some(self.read())
    }

    fn subject_title(&self) -> Option<&str> {
        Some(self.title())
    }

    fn subject_url(&self) -> Option<&str> {
        self.link()
    }
}

impl Subject for Enclosure {
    fn subject_id(&self) -> Option<RecordId> {
        self.id().map(|id| id.record())
    }

    fn subject_parent(&self) -> Option<RecordId> {
        self.article().map(|id| id.record())
    }

    fn subject_labels(&self) -> Option<&BTreeSet<String>> {
        None
    }

    fn subject_read(&self) -> Option<bool> {
        None
    }

    fn subject_title(&self) -> Option<&str> {
        None
    }

    fn subject_url(&self) -> Option<&str> {
        Some(self.url())
    }
}
