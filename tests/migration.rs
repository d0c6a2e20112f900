//! Copying whole libraries between backends.

use pretty_assertions::assert_eq;
use std::sync::Arc;

use feedsync::migrate::Migrator;
use feedsync::model::{Article, Enclosure, EntityKind, Feed, Stored};
use feedsync::storage::{ObjectStore, Predicate, Query, SqliteStore, StorageBackend, Window};

async fn all<T: Stored>(backend: &Arc<dyn StorageBackend>) -> Vec<T> {
    backend
        .entities_matching(&Query::new(T::KIND, Predicate::All), Window::all())
        .await
        .unwrap()
        .into_iter()
        .filter_map(T::from_entity)
        .collect()
}

async fn count(backend: &Arc<dyn StorageBackend>, kind: EntityKind) -> usize {
    backend
        .count_matching(&Query::new(kind, Predicate::All))
        .await
        .unwrap()
}

/// Two subscriptions, a query feed, three articles, two enclosures and one
/// related edge.
async fn populate(backend: &Arc<dyn StorageBackend>) {
    let mut news = backend.create_feed().await.unwrap();
    news.set_title("News");
    news.set_summary("Daily news");
    news.set_url(Some("https://news.example/feed.xml".into())).unwrap();
    news.set_tags(["daily", "world"]);
    news.set_wait_period(4);
    news.set_remaining_wait(1);
    news.set_image(Some(vec![7, 7, 7]));
    backend.save_feed(&mut news).await.unwrap();

    let mut blog = backend.create_feed().await.unwrap();
    blog.set_title("Blog");
    blog.set_url(Some("https://blog.example/atom.xml".into())).unwrap();
    backend.save_feed(&mut blog).await.unwrap();

    let mut unread = backend.create_feed().await.unwrap();
    unread.set_title("Unread");
    unread.set_query(Some("unread".into()));
    backend.save_feed(&mut unread).await.unwrap();

    let mut headline = backend.create_article(Some(&news)).await.unwrap();
    headline.set_title("Headline");
    headline.set_link(Some("https://news.example/headline".into()));
    headline.set_content("word ".repeat(400));
    headline.set_read(true);
    headline.add_flag("starred");
    backend.save_article(&mut headline).await.unwrap();

    let mut brief = backend.create_article(Some(&news)).await.unwrap();
    brief.set_title("Brief");
    brief.set_estimated_reading_time(0.5);
    backend.save_article(&mut brief).await.unwrap();

    let mut post = backend.create_article(Some(&blog)).await.unwrap();
    post.set_title("Post");
    post.set_author("Ada");
    post.relate(&mut headline).unwrap();
    backend.save_article(&mut post).await.unwrap();

    for (url, kind) in [
        ("https://news.example/a.mp3", "audio/mpeg"),
        ("https://news.example/b.jpg", "image/jpeg"),
    ] {
        let mut enclosure = backend.create_enclosure(Some(&headline)).await.unwrap();
        enclosure.set_url(url);
        enclosure.set_kind(kind);
        backend.save_enclosure(&mut enclosure).await.unwrap();
    }
}

fn find_feed<'a>(feeds: &'a [Feed], title: &str) -> &'a Feed {
    feeds.iter().find(|f| f.title() == title).unwrap()
}

fn find_article<'a>(articles: &'a [Article], title: &str) -> &'a Article {
    articles.iter().find(|a| a.title() == title).unwrap()
}

#[tokio::test]
async fn test_migration_copies_every_entity_with_resolved_parents() {
    let source: Arc<dyn StorageBackend> = Arc::new(ObjectStore::in_memory());
    let destination: Arc<dyn StorageBackend> = Arc::new(SqliteStore::open(":memory:").await.unwrap());
    populate(&source).await;

    let report = Migrator::new(Arc::clone(&source), Arc::clone(&destination))
        .run()
        .await
        .unwrap();

    assert!(report.is_complete(), "{:?}", report.failures);
    assert_eq!(report.feeds_created, 3);
    assert_eq!(report.articles_created, 3);
    assert_eq!(report.enclosures_created, 2);
    assert_eq!(report.related_edges, 1);
    assert_eq!(report.feeds_skipped + report.articles_skipped + report.enclosures_skipped, 0);

    let source_feeds: Vec<Feed> = all(&source).await;
    let feeds: Vec<Feed> = all(&destination).await;
    assert_eq!(feeds.len(), 3);
    for original in &source_feeds {
        let copy = find_feed(&feeds, original.title());
        assert_eq!(copy.record(), original.record());
        assert_ne!(copy.id(), original.id());
    }

    let articles: Vec<Article> = all(&destination).await;
    let news = find_feed(&feeds, "News");
    let blog = find_feed(&feeds, "Blog");
    let headline = find_article(&articles, "Headline");
    let brief = find_article(&articles, "Brief");
    let post = find_article(&articles, "Post");
    assert_eq!(headline.feed(), news.id());
    assert_eq!(brief.feed(), news.id());
    assert_eq!(post.feed(), blog.id());
    assert!(headline.read());
    assert!(headline.flags().contains("starred"));
    assert_eq!(post.author(), "Ada");

    // Non-positive reading times are recomputed, positive ones kept.
    assert_eq!(headline.estimated_reading_time(), 2.0);
    assert_eq!(brief.estimated_reading_time(), 0.5);

    assert!(headline.related().contains(&post.id().unwrap()));
    assert!(post.related().contains(&headline.id().unwrap()));
    assert!(brief.related().is_empty());

    let enclosures: Vec<Enclosure> = all(&destination).await;
    assert_eq!(enclosures.len(), 2);
    assert!(enclosures.iter().all(|e| e.article() == headline.id()));
    let mut kinds: Vec<&str> = enclosures.iter().map(|e| e.kind()).collect();
    kinds.sort();
    assert_eq!(kinds, vec!["audio/mpeg", "image/jpeg"]);

    // The copied query feed selects from the destination.
    let unread = find_feed(&feeds, "Unread");
    assert!(unread.is_query_feed());
    assert_eq!(unread.articles().len().await.unwrap(), 2);
}

#[tokio::test]
async fn test_second_run_creates_nothing() {
    let source: Arc<dyn StorageBackend> = Arc::new(SqliteStore::open(":memory:").await.unwrap());
    let destination: Arc<dyn StorageBackend> = Arc::new(ObjectStore::in_memory());
    populate(&source).await;
    let migrator = Migrator::new(Arc::clone(&source), Arc::clone(&destination)).with_concurrency(2);

    migrator.run().await.unwrap();
    let second = migrator.run().await.unwrap();

    assert!(second.is_complete());
    assert_eq!(second.feeds_created, 0);
    assert_eq!(second.articles_created, 0);
    assert_eq!(second.enclosures_created, 0);
    assert_eq!(second.related_edges, 0);
    assert_eq!(second.feeds_skipped, 3);
    assert_eq!(second.articles_skipped, 3);
    assert_eq!(second.enclosures_skipped, 2);

    assert_eq!(count(&destination, EntityKind::Feed).await, 3);
    assert_eq!(count(&destination, EntityKind::Article).await, 3);
    assert_eq!(count(&destination, EntityKind::Enclosure).await, 2);
}

#[tokio::test]
async fn test_existing_destination_feed_adopts_migrated_articles() {
    let source: Arc<dyn StorageBackend> = Arc::new(ObjectStore::in_memory());
    let destination: Arc<dyn StorageBackend> = Arc::new(ObjectStore::in_memory());
    populate(&source).await;

    // The destination already has an identical "Blog" feed.
    let mut blog = destination.create_feed().await.unwrap();
    blog.set_title("Blog");
    blog.set_url(Some("https://blog.example/atom.xml".into())).unwrap();
    destination.save_feed(&mut blog).await.unwrap();

    let report = Migrator::new(Arc::clone(&source), Arc::clone(&destination))
        .run()
        .await
        .unwrap();
    assert_eq!(report.feeds_created, 2);
    assert_eq!(report.feeds_skipped, 1);
    assert_eq!(count(&destination, EntityKind::Feed).await, 3);

    let articles: Vec<Article> = all(&destination).await;
    assert_eq!(find_article(&articles, "Post").feed(), blog.id());
}

#[tokio::test]
async fn test_empty_source_is_a_no_op() {
    let source: Arc<dyn StorageBackend> = Arc::new(ObjectStore::in_memory());
    let destination: Arc<dyn StorageBackend> = Arc::new(SqliteStore::open(":memory:").await.unwrap());
    let report = Migrator::new(source, Arc::clone(&destination)).run().await.unwrap();
    assert_eq!(report, Default::default());
    assert_eq!(count(&destination, EntityKind::Feed).await, 0);
}
