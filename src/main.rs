use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use feedsync::config::{BackendKind, Config};
use feedsync::feed::{
    FeedRsParser, ReqwestDownloader, UpdateEvent, UpdateOutcome, UpdateService,
};
use feedsync::migrate::Migrator;
use feedsync::storage::{Library, ObjectStore, SqliteStore, StorageBackend};
use feedsync::util::{strip_control_chars, validate_feed_url};

/// Get the config directory path (~/.config/feedsync/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedsync"))
}

#[derive(Parser, Debug)]
#[command(name = "feedsync", about = "Feed library with swappable storage backends")]
struct Args {
    /// Config file (default: ~/.config/feedsync/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use this backend instead of the configured one
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed and fetch it once
    Add {
        url: String,

        /// Display title (default: the feed's own title)
        #[arg(long)]
        title: Option<String>,

        /// Tag to attach (repeatable)
        #[arg(long = "tag", value_name = "TAG")]
        tags: Vec<String>,
    },

    /// Add a query feed, e.g. `feedsync add-query Unread "unread -flag:muted"`
    AddQuery { title: String, expression: String },

    /// List feeds with their unread counts
    List,

    /// Update every feed once
    Refresh,

    /// Copy the whole library into another backend
    Migrate {
        #[arg(long, value_enum)]
        to: BackendKind,
    },

    /// Unsubscribe from a feed and delete its articles
    Remove { url: String },
}

async fn open_backend(kind: BackendKind, config: &Config, config_dir: &Path) -> Result<Arc<dyn StorageBackend>> {
    let path = config.store_path(kind, config_dir);
    let backend: Arc<dyn StorageBackend> = match kind {
        BackendKind::Sqlite => {
            let path_str = path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
            Arc::new(
                SqliteStore::open(path_str)
                    .await
                    .with_context(|| format!("Failed to open database '{}'", path.display()))?,
            )
        }
        BackendKind::Object => Arc::new(
            ObjectStore::open(&path)
                .await
                .with_context(|| format!("Failed to open object store '{}'", path.display()))?,
        ),
    };
    tracing::debug!(backend = %kind, path = %path.display(), "Opened store");
    Ok(backend)
}

fn update_service(library: Arc<Library>, config: &Config) -> Result<UpdateService> {
    let downloader = ReqwestDownloader::new(
        &config.user_agent,
        config.request_timeout(),
        config.max_feed_bytes,
    )
    .context("Failed to build HTTP client")?;
    Ok(
        UpdateService::new(library, Arc::new(downloader), Arc::new(FeedRsParser))
            .with_concurrency(config.refresh_concurrency),
    )
}

fn describe(outcome: &UpdateOutcome) -> String {
    match outcome {
        UpdateOutcome::Skipped => "skipped".to_string(),
        UpdateOutcome::Deferred { remaining } => {
            format!("backing off ({remaining} more refreshes)")
        }
        UpdateOutcome::Updated { summary, image } => format!(
            "{} new, {} updated{}{}",
            summary.created,
            summary.updated,
            if summary.failed > 0 {
                format!(", {} failed", summary.failed)
            } else {
                String::new()
            },
            if *image { ", image saved" } else { "" }
        ),
        UpdateOutcome::ImageUpdated => "image saved".to_string(),
        UpdateOutcome::Unparseable => "not a feed document".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
            {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to set config directory permissions to 0700"
                );
            }
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path).context("Failed to load configuration")?;
    let kind = args.backend.unwrap_or(config.backend);

    let backend = open_backend(kind, &config, &config_dir).await?;
    let library = Arc::new(
        Library::new(backend)
            .with_upsert_concurrency(config.upsert_concurrency)
            .with_paging(config.page_size, config.page_cache_pages),
    );

    match args.command {
        Command::Add { url, title, tags } => {
            let url = validate_feed_url(&url, config.allow_private_hosts)
                .with_context(|| format!("Refusing feed URL '{url}'"))?;
            if library.feed_with_url(url.as_str()).await?.is_some() {
                anyhow::bail!("Already subscribed to {url}");
            }
            let mut feed = library
                .subscribe(url.as_str(), title.as_deref().unwrap_or(""), tags)
                .await
                .context("Failed to save subscription")?;
            let service = update_service(Arc::clone(&library), &config)?;
            match service.update_feed(&mut feed).await {
                Ok(outcome) => println!(
                    "Added {}: {}",
                    strip_control_chars(feed.title()),
                    describe(&outcome)
                ),
                Err(e) => println!("Added {url}, but the first update failed: {e}"),
            }
        }

        Command::AddQuery { title, expression } => {
            let feed = library
                .add_query_feed(&title, &expression)
                .await
                .context("Failed to add query feed")?;
            let matches = feed.articles().len().await?;
            println!(
                "Added query feed {}: {matches} matching articles",
                strip_control_chars(feed.title())
            );
        }

        Command::List => {
            let feeds = library.feeds().to_vec().await?;
            if feeds.is_empty() {
                println!("No feeds. Add one with `feedsync add <url>`.");
            }
            for feed in &feeds {
                let unread = library.unread_articles_of(feed).len().await?;
                let source = feed
                    .query()
                    .map(|query| format!("query: {query}"))
                    .or_else(|| feed.url().map(str::to_string))
                    .unwrap_or_default();
                println!("{:>5}  {}  ({source})", unread, strip_control_chars(feed.title()));
            }
        }

        Command::Refresh => {
            let feeds = library.feeds().to_vec().await?;
            let service = update_service(Arc::clone(&library), &config)?;
            let (event_tx, mut event_rx) = mpsc::channel::<UpdateEvent>(32);
            let printer = tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    let title = strip_control_chars(&event.title);
                    match event.outcome {
                        Ok(outcome) => println!("{title}: {}", describe(&outcome)),
                        Err(e) => println!("{title}: failed: {e}"),
                    }
                }
            });
            let results = service.refresh_all(feeds, Some(event_tx)).await;
            printer.await.context("Event printer panicked")?;
            let failed = results.iter().filter(|r| r.result.is_err()).count();
            println!("Refreshed {} feeds, {failed} failed", results.len());
        }

        Command::Migrate { to } => {
            if to == kind {
                anyhow::bail!("Source and destination are both the {kind} backend");
            }
            let destination = open_backend(to, &config, &config_dir).await?;
            let report = Migrator::new(Arc::clone(library.backend()), destination)
                .with_concurrency(config.upsert_concurrency)
                .run()
                .await
                .context("Migration failed")?;
            println!(
                "Migrated {} feeds, {} articles, {} enclosures and {} related links ({} already present)",
                report.feeds_created,
                report.articles_created,
                report.enclosures_created,
                report.related_edges,
                report.feeds_skipped + report.articles_skipped + report.enclosures_skipped,
            );
            for failure in &report.failures {
                eprintln!(
                    "Warning: {} {} was not migrated: {}",
                    failure.kind, failure.source_id, failure.error
                );
            }
        }

        Command::Remove { url } => {
            let feed = library
                .feed_with_url(&url)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Not subscribed to {url}"))?;
            let title = feed.title().to_string();
            library.remove_feed(feed).await.context("Failed to remove feed")?;
            println!("Removed {title}");
        }
    }

    Ok(())
}
