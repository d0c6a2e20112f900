//! Predicate → SQL compilation.
//!
//! Null-safe comparisons (`IS`) are used on nullable columns so `NOT` behaves
//! the same way as in-memory evaluation.

use sqlx::{QueryBuilder, Sqlite};

use crate::model::{EntityKind, RecordId};
use crate::storage::Predicate;

pub(super) fn table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Feed => "feeds",
        EntityKind::Article => "articles",
        EntityKind::Enclosure => "enclosures",
    }
}

/// Append `predicate` as a boolean SQL expression over `table(kind)`.
pub(super) fn push_predicate(qb: &mut QueryBuilder<'_, Sqlite>, kind: EntityKind, predicate: &Predicate) {
    match predicate {
        Predicate::All => {
            qb.push("1");
        }
        Predicate::Id(id) => match id {
            RecordId::Row(row) => {
                qb.push(format!("{}.id = ", table(kind))).push_bind(*row);
            }
            RecordId::Object(_) => {
                qb.push("0");
            }
        },
        Predicate::Parent(id) => {
            let column = match kind {
                EntityKind::Feed => None,
                EntityKind::Article => Some("articles.feed_id"),
                EntityKind::Enclosure => Some("enclosures.article_id"),
            };
            match (column, id.as_row()) {
                (Some(column), Some(row)) => {
                    qb.push(format!("{column} IS ")).push_bind(row);
                }
                _ => {
                    qb.push("0");
                }
            }
        }
        Predicate::Tagged(label) => match kind {
            EntityKind::Feed => {
                qb.push("EXISTS (SELECT 1 FROM feed_tags t WHERE t.feed_id = feeds.id AND t.tag = ")
                    .push_bind(label.clone())
                    .push(")");
            }
            EntityKind::Article => {
                qb.push(
                    "EXISTS (SELECT 1 FROM article_flags f WHERE f.article_id = articles.id AND f.flag = ",
                )
                .push_bind(label.clone())
                .push(")");
            }
            EntityKind::Enclosure => {
                qb.push("0");
            }
        },
        Predicate::Unread | Predicate::Read => {
            if kind == EntityKind::Article {
                let read = matches!(predicate, Predicate::Read);
                qb.push("articles.read = ").push_bind(read);
            } else {
                qb.push("0");
            }
        }
        Predicate::TitleContains(needle) => match kind {
            EntityKind::Feed | EntityKind::Article => {
                qb.push(format!("instr(lower({}.title), lower(", table(kind)))
                    .push_bind(needle.clone())
                    .push(")) > 0");
            }
            EntityKind::Enclosure => {
                qb.push("0");
            }
        },
        Predicate::UrlEquals(url) => {
            let column = match kind {
                EntityKind::Feed => "feeds.url",
                EntityKind::Article => "articles.link",
                EntityKind::Enclosure => "enclosures.url",
            };
            qb.push(format!("{column} IS ")).push_bind(url.clone());
        }
        Predicate::And(terms) => push_joined(qb, kind, terms, " AND ", "1"),
        Predicate::Or(terms) => push_joined(qb, kind, terms, " OR ", "0"),
        Predicate::Not(inner) => {
            qb.push("NOT (");
            push_predicate(qb, kind, inner);
            qb.push(")");
        }
    }
}

fn push_joined(
    qb: &mut QueryBuilder<'_, Sqlite>,
    kind: EntityKind,
    terms: &[Predicate],
    separator: &str,
    empty: &str,
) {
    if terms.is_empty() {
        qb.push(empty);
        return;
    }
    qb.push("(");
    for (i, term) in terms.iter().enumerate() {
        if i > 0 {
            qb.push(separator);
        }
        qb.push("(");
        push_predicate(qb, kind, term);
        qb.push(")");
    }
    qb.push(")");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(kind: EntityKind, predicate: &Predicate) -> String {
        let mut qb = QueryBuilder::<Sqlite>::new("");
        push_predicate(&mut qb, kind, predicate);
        qb.sql().to_string()
    }

    #[test]
    fn test_compiles_article_terms() {
        let predicate = Predicate::parse_expression("unread flag:later | title:rust").unwrap();
        let sql = compile(EntityKind::Article, &predicate);
        assert_eq!(
            sql,
            "((((articles.read = ?) AND (EXISTS (SELECT 1 FROM article_flags f WHERE f.article_id = articles.id AND f.flag = ?)))) OR (instr(lower(articles.title), lower(?)) > 0))"
        );
    }

    #[test]
    fn test_foreign_ids_match_nothing() {
        let sql = compile(EntityKind::Feed, &Predicate::Id(RecordId::new_object()));
        assert_eq!(sql, "0");
        assert_eq!(compile(EntityKind::Feed, &Predicate::Unread), "0");
    }

    #[test]
    fn test_nullable_columns_use_is() {
        let sql = compile(
            EntityKind::Feed,
            &Predicate::Not(Box::new(Predicate::UrlEquals("https://a".into()))),
        );
        assert_eq!(sql, "NOT (feeds.url IS ?)");
    }
}
