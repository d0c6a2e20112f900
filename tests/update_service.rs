//! End-to-end updates against a mock HTTP server.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedsync::feed::{
    DownloadError, FeedRsParser, ReqwestDownloader, UpdateError, UpdateOutcome, UpdateService,
    DEFAULT_MAX_BYTES,
};
use feedsync::model::{Entity, Feed};
use feedsync::storage::{
    ApplySummary, Library, ObjectStore, Predicate, Query, SqliteStore, StorageBackend, Window,
};

fn rss(image: Option<&str>, items: &[(&str, &str)]) -> String {
    let image = image
        .map(|url| format!("<image><url>{url}</url><title>Logo</title><link>https://example.com</link></image>"))
        .unwrap_or_default();
    let items: String = items
        .iter()
        .map(|(title, link)| {
            format!("<item><title>{title}</title><link>{link}</link><description>About {title}</description></item>")
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Mock Feed</title>
    <link>https://example.com</link>
    <description>Served by wiremock</description>
    {image}
    {items}
  </channel>
</rss>"#
    )
}

async fn serve(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/rss+xml")
                .set_body_string(body),
        )
        .mount(server)
        .await;
}

fn service(backend: Arc<dyn StorageBackend>) -> UpdateService {
    let downloader =
        ReqwestDownloader::new("feedsync-test", Duration::from_secs(5), DEFAULT_MAX_BYTES).unwrap();
    UpdateService::new(
        Arc::new(Library::new(backend)),
        Arc::new(downloader),
        Arc::new(FeedRsParser),
    )
}

async fn subscribe(service: &UpdateService, url: &str) -> Feed {
    service
        .library()
        .subscribe(url, "", Vec::<String>::new())
        .await
        .unwrap()
}

async fn stored_feed(backend: &Arc<dyn StorageBackend>, feed: &Feed) -> Feed {
    let found = backend
        .entities_matching(
            &Query::feeds(Predicate::Id(feed.id().unwrap().record())),
            Window::all(),
        )
        .await
        .unwrap();
    match found.into_iter().next() {
        Some(Entity::Feed(feed)) => feed,
        other => panic!("expected a feed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_document_without_image_creates_articles() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/feed.xml",
        rss(
            None,
            &[
                ("First", "https://example.com/1"),
                ("Second", "https://example.com/2"),
                ("Third", "https://example.com/3"),
            ],
        ),
    )
    .await;

    let backend: Arc<dyn StorageBackend> = Arc::new(SqliteStore::open(":memory:").await.unwrap());
    let service = service(Arc::clone(&backend));
    let url = format!("{}/feed.xml", server.uri());
    let mut feed = subscribe(&service, &url).await;

    let outcome = service.update_feed(&mut feed).await.unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Updated {
            summary: ApplySummary {
                created: 3,
                updated: 0,
                failed: 0
            },
            image: false,
        }
    );
    assert_eq!(feed.title(), "Mock Feed");
    assert_eq!(feed.summary(), "Served by wiremock");
    assert_eq!(feed.image(), None);
    assert_eq!(service.phase(&url), None);

    let stored = stored_feed(&backend, &feed).await;
    assert_eq!(stored.title(), "Mock Feed");
    let mut titles: Vec<String> = stored
        .articles()
        .to_vec()
        .await
        .unwrap()
        .iter()
        .map(|a| a.title().to_string())
        .collect();
    titles.sort();
    assert_eq!(titles, vec!["First", "Second", "Third"]);

    // Fetching the same document again updates instead of duplicating.
    let outcome = service.update_feed(&mut feed).await.unwrap();
    assert!(matches!(
        outcome,
        UpdateOutcome::Updated { summary: ApplySummary { created: 0, updated: 3, .. }, .. }
    ));
    assert_eq!(stored_feed(&backend, &feed).await.articles().len().await.unwrap(), 3);
}

#[tokio::test]
async fn test_document_with_image_fetches_it_before_completing() {
    let server = MockServer::start().await;
    let image_url = format!("{}/logo.png", server.uri());
    serve(
        &server,
        "/feed.xml",
        rss(Some(&image_url), &[("Only", "https://example.com/only")]),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/logo.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/png")
                .set_body_bytes(vec![0x89, b'P', b'N', b'G']),
        )
        .expect(1)
        .mount(&server)
        .await;

    let backend: Arc<dyn StorageBackend> = Arc::new(ObjectStore::in_memory());
    let service = service(Arc::clone(&backend));
    let url = format!("{}/feed.xml", server.uri());
    let mut feed = subscribe(&service, &url).await;

    let outcome = service.update_feed(&mut feed).await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::Updated { image: true, .. }));
    assert_eq!(feed.image(), Some(&[0x89, b'P', b'N', b'G'][..]));
    assert_eq!(stored_feed(&backend, &feed).await.image(), feed.image());
    assert_eq!(service.phase(&url), None);
    assert_eq!(service.phase(&image_url), None);

    // With an image in place the second download is not repeated.
    service.update_feed(&mut feed).await.unwrap();
}

#[tokio::test]
async fn test_failed_image_download_keeps_the_articles() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/feed.xml",
        rss(Some("/missing.png"), &[("Kept", "https://example.com/kept")]),
    )
    .await;

    let backend: Arc<dyn StorageBackend> = Arc::new(ObjectStore::in_memory());
    let service = service(Arc::clone(&backend));
    let mut feed = subscribe(&service, &format!("{}/feed.xml", server.uri())).await;

    let err = service.update_feed(&mut feed).await.unwrap_err();
    assert!(matches!(err, UpdateError::Image(DownloadError::HttpStatus(404))));
    assert!(!err.is_offense());
    assert_eq!(
        backend
            .count_matching(&Query::articles(Predicate::All))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_network_error_releases_the_url() {
    // Nothing listens on a port that was just released.
    let url = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        format!("http://{}/feed.xml", listener.local_addr().unwrap())
    };

    let backend: Arc<dyn StorageBackend> = Arc::new(ObjectStore::in_memory());
    let service = service(backend);
    let mut feed = subscribe(&service, &url).await;

    let err = service.update_feed(&mut feed).await.unwrap_err();
    assert!(matches!(err, UpdateError::Download(DownloadError::Network(_))));
    assert!(err.is_offense());
    assert_eq!(service.phase(&url), None);
    assert_eq!(feed.title(), "");
}

#[tokio::test]
async fn test_refresh_round_applies_backoff_and_reports_every_feed() {
    let server = MockServer::start().await;
    serve(&server, "/good.xml", rss(None, &[("Fine", "https://example.com/fine")])).await;
    Mock::given(method("GET"))
        .and(path("/bad.xml"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let backend: Arc<dyn StorageBackend> = Arc::new(ObjectStore::in_memory());
    let service = service(Arc::clone(&backend)).with_concurrency(2);
    let good = subscribe(&service, &format!("{}/good.xml", server.uri())).await;
    let mut bad = subscribe(&service, &format!("{}/bad.xml", server.uri())).await;
    // Two earlier failures: the next one starts a wait.
    bad.set_wait_period(2);
    backend.save_feed(&mut bad).await.unwrap();
    let query = service
        .library()
        .add_query_feed("Everything unread", "unread")
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    let results = service
        .refresh_all(vec![good.clone(), bad.clone(), query], Some(tx))
        .await;
    assert_eq!(results.len(), 3);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(events.len(), 3);
    let bad_event = events.iter().find(|e| e.feed == bad.id()).unwrap();
    assert!(bad_event.outcome.as_ref().unwrap_err().contains("500"));
    let good_event = events.iter().find(|e| e.feed == good.id()).unwrap();
    assert!(matches!(good_event.outcome, Ok(UpdateOutcome::Updated { .. })));
    assert!(events
        .iter()
        .any(|e| e.outcome == Ok(UpdateOutcome::Skipped)));

    let stored_bad = stored_feed(&backend, &bad).await;
    assert_eq!(stored_bad.wait_period(), 3);
    assert_eq!(stored_bad.remaining_wait(), 1);
    let stored_good = stored_feed(&backend, &good).await;
    assert_eq!(stored_good.wait_period(), 0);
    assert_eq!(stored_good.title(), "Mock Feed");

    // The failing feed sits out the next round without a request.
    let requests_before = server.received_requests().await.unwrap().len();
    let results = service.refresh_all(vec![stored_bad], None).await;
    assert_eq!(
        results[0].result.as_ref().unwrap(),
        &UpdateOutcome::Deferred { remaining: 0 }
    );
    assert_eq!(server.received_requests().await.unwrap().len(), requests_before);
    assert_eq!(stored_feed(&backend, &bad).await.remaining_wait(), 0);
}
