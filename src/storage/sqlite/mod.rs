//! Embedded SQLite backend.
//!
//! Tags, flags and related-article edges live in side tables; every child
//! table references its parent with `ON DELETE CASCADE`, so deleting a feed
//! removes its articles, their enclosures, flags and edges in one statement.

mod filter;
mod rows;

use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    QueryBuilder, Sqlite, SqlitePool,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use self::filter::{push_predicate, table};
use self::rows::{
    encode_time, to_i64, ArticleRow, EnclosureRow, FeedRow, ARTICLE_COLUMNS, ENCLOSURE_COLUMNS,
    FEED_COLUMNS,
};
use super::port::{BackendError, Query, StorageBackend, Window};
use super::{articles_of_feed, enclosures_of};
use crate::model::{Article, Enclosure, Entity, EntityKind, Feed, RecordId};

// ============================================================================
// Error mapping
// ============================================================================

/// Map a sqlx error onto the backend classification.
///
/// SQLITE_BUSY / SQLITE_LOCKED / SQLITE_CANTOPEN are write failures; a foreign
/// key violation means the referenced parent row does not exist.
pub(crate) fn from_sqlx(err: sqlx::Error) -> BackendError {
    let error_string = err.to_string().to_lowercase();

    if error_string.contains("database is locked")
        || error_string.contains("database table is locked")
        || error_string.contains("sqlite_busy")
        || error_string.contains("sqlite_locked")
        || error_string.contains("unable to open database file")
    {
        return BackendError::write_failure(err.to_string());
    }

    match err {
        sqlx::Error::RowNotFound => BackendError::not_found("row not found"),
        sqlx::Error::Database(db_err) => {
            if db_err.message().contains("FOREIGN KEY constraint failed") {
                BackendError::not_found(db_err.message().to_string())
            } else {
                BackendError::write_failure(db_err.message().to_string())
            }
        }
        other => BackendError::unknown(other.to_string()),
    }
}

fn row_id(id: Option<RecordId>, kind: EntityKind) -> Result<i64, BackendError> {
    let id = id.ok_or_else(|| BackendError::unsaved(kind))?;
    id.as_row()
        .ok_or_else(|| BackendError::not_found(format!("{kind} {id} belongs to another store")))
}

// ============================================================================
// Store
// ============================================================================

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open a database and run migrations. `":memory:"` opens a private
    /// in-memory database held by a single pooled connection.
    pub async fn open(path: &str) -> Result<Self, BackendError> {
        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", path)
        };

        #[cfg(unix)]
        if !in_memory {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            }
        }

        // busy_timeout lets SQLite wait out short lock contention from
        // concurrent upserts instead of failing immediately.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");

        let pool_options = if in_memory {
            // Every connection to :memory: is its own database; keep exactly one alive.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(from_sqlx)?;

        let store = Self { pool };
        store.migrate().await.map_err(|e| {
            let mapped = from_sqlx(e);
            BackendError::new(mapped.kind, format!("migration failed: {}", mapped.message))
        })?;
        tracing::debug!(path = %path, "Opened SQLite store");
        Ok(store)
    }

    /// Create the schema inside one transaction. Idempotent.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL DEFAULT '',
                url TEXT,
                summary TEXT NOT NULL DEFAULT '',
                query TEXT,
                wait_period INTEGER NOT NULL DEFAULT 0,
                remaining_wait INTEGER NOT NULL DEFAULT 0,
                image BLOB
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_tags (
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                tag TEXT NOT NULL,
                PRIMARY KEY (feed_id, tag)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feed_id INTEGER REFERENCES feeds(id) ON DELETE CASCADE,
                title TEXT NOT NULL DEFAULT '',
                link TEXT,
                summary TEXT NOT NULL DEFAULT '',
                author TEXT NOT NULL DEFAULT '',
                published TEXT,
                updated TEXT,
                content TEXT NOT NULL DEFAULT '',
                read INTEGER NOT NULL DEFAULT 0,
                reading_time REAL NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS article_flags (
                article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                flag TEXT NOT NULL,
                PRIMARY KEY (article_id, flag)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Each unordered pair is stored once, smaller id first.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS related_articles (
                a INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                b INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                PRIMARY KEY (a, b),
                CHECK (a < b)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS enclosures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                article_id INTEGER REFERENCES articles(id) ON DELETE CASCADE,
                url TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL DEFAULT ''
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_feed ON articles(feed_id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_feed_read ON articles(feed_id, read)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_related_b ON related_articles(b)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_enclosures_article ON enclosures(article_id)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    fn backend(&self) -> Arc<dyn StorageBackend> {
        Arc::new(self.clone())
    }

    fn hydrate_feed(&self, row: FeedRow) -> Result<Feed, BackendError> {
        let (id, record) = row.into_parts()?;
        let articles = articles_of_feed(self.backend(), id, record.query.as_deref());
        Ok(Feed::hydrate(id, record, articles))
    }

    fn hydrate_article(&self, row: ArticleRow) -> Result<Article, BackendError> {
        let parts = row.into_parts()?;
        Ok(Article::hydrate(
            parts.id,
            parts.feed,
            parts.record,
            parts.related,
            enclosures_of(self.backend(), parts.id),
        ))
    }

    async fn fetch_feed(&self, id: i64) -> Result<Feed, BackendError> {
        let row: FeedRow = sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE feeds.id = ?"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(from_sqlx)?;
        self.hydrate_feed(row)
    }

    async fn fetch_article(&self, id: i64) -> Result<Article, BackendError> {
        let row: ArticleRow = sqlx::query_as(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE articles.id = ?"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(from_sqlx)?;
        self.hydrate_article(row)
    }
}

#[async_trait]
impl StorageBackend for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn create_feed(&self) -> Result<Feed, BackendError> {
        let id = sqlx::query("INSERT INTO feeds DEFAULT VALUES")
            .execute(&self.pool)
            .await
            .map_err(from_sqlx)?
            .last_insert_rowid();
        self.fetch_feed(id).await
    }

    async fn create_article(&self, feed: Option<&Feed>) -> Result<Article, BackendError> {
        let feed_id = match feed {
            Some(feed) if !feed.is_query_feed() => {
                Some(row_id(feed.id().map(|id| id.record()), EntityKind::Feed)?)
            }
            _ => None,
        };
        let id = sqlx::query("INSERT INTO articles (feed_id) VALUES (?)")
            .bind(feed_id)
            .execute(&self.pool)
            .await
            .map_err(from_sqlx)?
            .last_insert_rowid();
        self.fetch_article(id).await
    }

    async fn create_enclosure(&self, article: Option<&Article>) -> Result<Enclosure, BackendError> {
        let article_id = article
            .map(|article| row_id(article.id().map(|id| id.record()), EntityKind::Article))
            .transpose()?;
        let id = sqlx::query("INSERT INTO enclosures (article_id) VALUES (?)")
            .bind(article_id)
            .execute(&self.pool)
            .await
            .map_err(from_sqlx)?
            .last_insert_rowid();
        let row: EnclosureRow = sqlx::query_as(&format!(
            "SELECT {ENCLOSURE_COLUMNS} FROM enclosures WHERE enclosures.id = ?"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(from_sqlx)?;
        let (id, article, record) = row.into_parts();
        Ok(Enclosure::hydrate(id, article, record))
    }

    async fn count_matching(&self, query: &Query) -> Result<usize, BackendError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT COUNT(*) FROM {} WHERE ", table(query.kind)));
        push_predicate(&mut qb, query.kind, &query.predicate);
        let (count,): (i64,) = qb
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(from_sqlx)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn entities_matching(
        &self,
        query: &Query,
        window: Window,
    ) -> Result<Vec<Entity>, BackendError> {
        let columns = match query.kind {
            EntityKind::Feed => FEED_COLUMNS,
            EntityKind::Article => ARTICLE_COLUMNS,
            EntityKind::Enclosure => ENCLOSURE_COLUMNS,
        };
        let table = table(query.kind);
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {columns} FROM {table} WHERE "));
        push_predicate(&mut qb, query.kind, &query.predicate);
        qb.push(format!(" ORDER BY {table}.id LIMIT "))
            .push_bind(to_i64(window.limit))
            .push(" OFFSET ")
            .push_bind(to_i64(window.offset));

        match query.kind {
            EntityKind::Feed => {
                let rows: Vec<FeedRow> = qb
                    .build_query_as()
                    .fetch_all(&self.pool)
                    .await
                    .map_err(from_sqlx)?;
                rows.into_iter()
                    .map(|row| self.hydrate_feed(row).map(Entity::Feed))
                    .collect()
            }
            EntityKind::Article => {
                let rows: Vec<ArticleRow> = qb
                    .build_query_as()
                    .fetch_all(&self.pool)
                    .await
                    .map_err(from_sqlx)?;
                rows.into_iter()
                    .map(|row| self.hydrate_article(row).map(Entity::Article))
                    .collect()
            }
            EntityKind::Enclosure => {
                let rows: Vec<EnclosureRow> = qb
                    .build_query_as()
                    .fetch_all(&self.pool)
                    .await
                    .map_err(from_sqlx)?;
                Ok(rows
                    .into_iter()
                    .map(|row| {
                        let (id, article, record) = row.into_parts();
                        Entity::Enclosure(Enclosure::hydrate(id, article, record))
                    })
                    .collect())
            }
        }
    }

    async fn save_feed(&self, feed: &mut Feed) -> Result<(), BackendError> {
        let id = row_id(feed.id().map(|id| id.record()), EntityKind::Feed)?;
        let record = feed.record();
        let mut tx = self.pool.begin().await.map_err(from_sqlx)?;

        let updated = sqlx::query(
            "UPDATE feeds SET title = ?, url = ?, summary = ?, query = ?, wait_period = ?, \
             remaining_wait = ?, image = ? WHERE id = ?",
        )
        .bind(&record.title)
        .bind(&record.url)
        .bind(&record.summary)
        .bind(&record.query)
        .bind(i64::from(record.wait_period))
        .bind(i64::from(record.remaining_wait))
        .bind(&record.image)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(from_sqlx)?;
        if updated.rows_affected() == 0 {
            return Err(BackendError::not_found(format!("feed row:{id}")));
        }

        sqlx::query("DELETE FROM feed_tags WHERE feed_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(from_sqlx)?;
        for tag in &record.tags {
            sqlx::query("INSERT INTO feed_tags (feed_id, tag) VALUES (?, ?)")
                .bind(id)
                .bind(tag)
                .execute(&mut *tx)
                .await
                .map_err(from_sqlx)?;
        }

        tx.commit().await.map_err(from_sqlx)?;
        feed.mark_clean();
        Ok(())
    }

    async fn save_article(&self, article: &mut Article) -> Result<(), BackendError> {
        let id = row_id(article.id().map(|id| id.record()), EntityKind::Article)?;
        let feed_id = article
            .feed()
            .map(|feed| row_id(Some(feed.record()), EntityKind::Feed))
            .transpose()?;
        let record = article.record();
        let mut tx = self.pool.begin().await.map_err(from_sqlx)?;

        let updated = sqlx::query(
            "UPDATE articles SET feed_id = ?, title = ?, link = ?, summary = ?, author = ?, \
             published = ?, updated = ?, content = ?, read = ?, reading_time = ? WHERE id = ?",
        )
        .bind(feed_id)
        .bind(&record.title)
        .bind(&record.link)
        .bind(&record.summary)
        .bind(&record.author)
        .bind(encode_time(record.published))
        .bind(encode_time(record.updated))
        .bind(&record.content)
        .bind(record.read)
        .bind(record.estimated_reading_time)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(from_sqlx)?;
        if updated.rows_affected() == 0 {
            return Err(BackendError::not_found(format!("article row:{id}")));
        }

        sqlx::query("DELETE FROM article_flags WHERE article_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(from_sqlx)?;
        for flag in &record.flags {
            sqlx::query("INSERT INTO article_flags (article_id, flag) VALUES (?, ?)")
                .bind(id)
                .bind(flag)
                .execute(&mut *tx)
                .await
                .map_err(from_sqlx)?;
        }

        sqlx::query("DELETE FROM related_articles WHERE a = ? OR b = ?")
            .bind(id)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(from_sqlx)?;
        for other in article.related().iter().filter_map(|other| other.record().as_row()) {
            if other == id {
                continue;
            }
            let (a, b) = if id < other { (id, other) } else { (other, id) };
            // Edges to rows that no longer exist are dropped.
            sqlx::query(
                "INSERT OR IGNORE INTO related_articles (a, b) \
                 SELECT ?, ? WHERE EXISTS (SELECT 1 FROM articles WHERE id = ?)",
            )
            .bind(a)
            .bind(b)
            .bind(other)
            .execute(&mut *tx)
            .await
            .map_err(from_sqlx)?;
        }

        tx.commit().await.map_err(from_sqlx)?;
        article.mark_clean();
        Ok(())
    }

    async fn save_enclosure(&self, enclosure: &mut Enclosure) -> Result<(), BackendError> {
        let id = row_id(enclosure.id().map(|id| id.record()), EntityKind::Enclosure)?;
        let article_id = enclosure
            .article()
            .map(|article| row_id(Some(article.record()), EntityKind::Article))
            .transpose()?;
        let updated = sqlx::query("UPDATE enclosures SET article_id = ?, url = ?, kind = ? WHERE id = ?")
            .bind(article_id)
            .bind(enclosure.url())
            .bind(enclosure.kind())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(from_sqlx)?;
        if updated.rows_affected() == 0 {
            return Err(BackendError::not_found(format!("enclosure row:{id}")));
        }
        enclosure.mark_clean();
        Ok(())
    }

    async fn delete_feed(&self, feed: Feed) -> Result<(), BackendError> {
        let id = row_id(feed.id().map(|id| id.record()), EntityKind::Feed)?;
        delete_row(&self.pool, "feeds", id).await
    }

    async fn delete_article(&self, article: Article) -> Result<(), BackendError> {
        let id = row_id(article.id().map(|id| id.record()), EntityKind::Article)?;
        delete_row(&self.pool, "articles", id).await
    }

    async fn delete_enclosure(&self, enclosure: Enclosure) -> Result<(), BackendError> {
        let id = row_id(enclosure.id().map(|id| id.record()), EntityKind::Enclosure)?;
        delete_row(&self.pool, "enclosures", id).await
    }
}

async fn delete_row(pool: &SqlitePool, table: &'static str, id: i64) -> Result<(), BackendError> {
    let deleted = sqlx::query(&format!("DELETE FROM {table} WHERE id = ?"))
        .bind(id)
        .execute(pool)
        .await
        .map_err(from_sqlx)?;
    if deleted.rows_affected() == 0 {
        return Err(BackendError::not_found(format!("{table} row:{id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BackendErrorKind, Predicate};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_migration_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feeds.db");
        let path = path.to_str().unwrap();

        let store = SqliteStore::open(path).await.unwrap();
        let mut feed = store.create_feed().await.unwrap();
        feed.set_title("Survives reopen");
        store.save_feed(&mut feed).await.unwrap();
        drop(store);

        let reopened = SqliteStore::open(path).await.unwrap();
        let count = reopened
            .count_matching(&Query::feeds(Predicate::TitleContains("survives".into())))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_cascade_removes_children() {
        let store = SqliteStore::open(":memory:").await.unwrap();
        let feed = store.create_feed().await.unwrap();
        let mut a = store.create_article(Some(&feed)).await.unwrap();
        let mut b = store.create_article(None).await.unwrap();
        a.relate(&mut b).unwrap();
        a.add_flag("starred");
        store.save_article(&mut a).await.unwrap();
        store.create_enclosure(Some(&a)).await.unwrap();

        store.delete_feed(feed).await.unwrap();

        for kind in [EntityKind::Article, EntityKind::Enclosure] {
            let remaining = store
                .count_matching(&Query::new(kind, Predicate::All))
                .await
                .unwrap();
            let expected = if kind == EntityKind::Article { 1 } else { 0 };
            assert_eq!(remaining, expected, "{kind}");
        }
        let (edges,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM related_articles")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(edges, 0);
    }

    #[tokio::test]
    async fn test_missing_parent_is_not_found() {
        let store = SqliteStore::open(":memory:").await.unwrap();
        let mut article = store.create_article(None).await.unwrap();
        let feed = store.create_feed().await.unwrap();
        crate::model::reparent_article(&mut article, None, &mut feed.clone());
        store.delete_feed(feed).await.unwrap();

        let err = store.save_article(&mut article).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::NotFound);
        assert!(article.is_dirty());
    }
}
