use chrono::{DateTime, Utc};
use feed_rs::parser;
use thiserror::Error;

/// Backend-neutral view of a fetched feed document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeed {
    pub title: String,
    pub description: String,
    pub image_url: Option<String>,
    pub items: Vec<ParsedItem>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedItem {
    pub title: String,
    pub link: Option<String>,
    pub description: String,
    pub content: Option<String>,
    pub authors: Vec<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub enclosures: Vec<ParsedEnclosure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedEnclosure {
    pub url: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unparseable feed document: {0}")]
pub struct ParseError(pub String);

/// Turns downloaded bytes into a [`ParsedFeed`].
pub trait FeedParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<ParsedFeed, ParseError>;
}

/// RSS 0.9x/1.0/2.0, Atom and JSON Feed via `feed-rs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedRsParser;

impl FeedParser for FeedRsParser {
    fn parse(&self, bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
        let feed = parser::parse(bytes).map_err(|e| ParseError(e.to_string()))?;

        let items = feed
            .entries
            .into_iter()
            .map(|entry| {
                let link = entry
                    .links
                    .iter()
                    .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
                    .or_else(|| entry.links.first())
                    .map(|l| l.href.clone());

                let mut enclosures: Vec<ParsedEnclosure> = Vec::new();
                let media = entry
                    .media
                    .iter()
                    .flat_map(|m| m.content.iter())
                    .filter_map(|c| {
                        let url = c.url.as_ref()?.to_string();
                        let kind = c
                            .content_type
                            .as_ref()
                            .map(|t| t.to_string())
                            .unwrap_or_default();
                        Some(ParsedEnclosure { url, kind })
                    });
                let linked = entry
                    .links
                    .iter()
                    .filter(|l| l.rel.as_deref() == Some("enclosure"))
                    .map(|l| ParsedEnclosure {
                        url: l.href.clone(),
                        kind: l.media_type.clone().unwrap_or_default(),
                    });
                for enclosure in media.chain(linked) {
                    if !enclosures.iter().any(|e| e.url == enclosure.url) {
                        enclosures.push(enclosure);
                    }
                }

                ParsedItem {
                    title: entry.title.map(|t| t.content).unwrap_or_default(),
                    link,
                    description: entry.summary.map(|s| s.content).unwrap_or_default(),
                    content: entry.content.and_then(|c| c.body),
                    authors: entry
                        .authors
                        .into_iter()
                        .map(|p| p.name)
                        .filter(|name| !name.trim().is_empty())
                        .collect(),
                    published: entry.published,
                    updated: entry.updated,
                    enclosures,
                }
            })
            .collect();

        Ok(ParsedFeed {
            title: feed.title.map(|t| t.content).unwrap_or_default(),
            description: feed.description.map(|d| d.content).unwrap_or_default(),
            image_url: feed.logo.or(feed.icon).map(|image| image.uri),
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Example Podcast</title>
    <link>https://example.com</link>
    <description>Weekly episodes</description>
    <image>
      <url>https://example.com/logo.png</url>
      <title>Example Podcast</title>
      <link>https://example.com</link>
    </image>
    <item>
      <title>Episode 1</title>
      <link>https://example.com/ep1</link>
      <description>The first one</description>
      <author>host@example.com (Host)</author>
      <pubDate>Mon, 06 Jan 2025 10:00:00 GMT</pubDate>
      <enclosure url="https://example.com/ep1.mp3" length="1000" type="audio/mpeg"/>
    </item>
    <item>
      <title>Episode 2</title>
      <link>https://example.com/ep2</link>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Example</title>
  <subtitle>Notes</subtitle>
  <id>urn:uuid:60a76c80-d399-11d9-b93C-0003939e0af6</id>
  <updated>2025-01-06T18:30:02Z</updated>
  <entry>
    <title>First note</title>
    <link rel="alternate" href="https://example.org/first"/>
    <link rel="enclosure" type="image/png" href="https://example.org/first.png"/>
    <id>urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6a</id>
    <updated>2025-01-06T18:30:02Z</updated>
    <content type="html">&lt;p&gt;Body text&lt;/p&gt;</content>
    <author><name>Ada</name></author>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_rss() {
        let parsed = FeedRsParser.parse(RSS.as_bytes()).unwrap();
        assert_eq!(parsed.title, "Example Podcast");
        assert_eq!(parsed.description, "Weekly episodes");
        assert_eq!(parsed.image_url.as_deref(), Some("https://example.com/logo.png"));
        assert_eq!(parsed.items.len(), 2);

        let first = &parsed.items[0];
        assert_eq!(first.title, "Episode 1");
        assert_eq!(first.link.as_deref(), Some("https://example.com/ep1"));
        assert_eq!(first.description, "The first one");
        assert!(first.published.is_some());
        assert_eq!(
            first.enclosures,
            vec![ParsedEnclosure {
                url: "https://example.com/ep1.mp3".into(),
                kind: "audio/mpeg".into(),
            }]
        );
        assert!(parsed.items[1].enclosures.is_empty());
    }

    #[test]
    fn test_parse_atom() {
        let parsed = FeedRsParser.parse(ATOM.as_bytes()).unwrap();
        assert_eq!(parsed.title, "Atom Example");
        assert_eq!(parsed.image_url, None);

        let entry = &parsed.items[0];
        assert_eq!(entry.link.as_deref(), Some("https://example.org/first"));
        assert_eq!(entry.content.as_deref(), Some("<p>Body text</p>"));
        assert_eq!(entry.authors, vec!["Ada".to_string()]);
        assert_eq!(entry.enclosures.len(), 1);
        assert_eq!(entry.enclosures[0].kind, "image/png");
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        assert!(FeedRsParser.parse(b"definitely not a feed").is_err());
        assert!(FeedRsParser.parse(b"").is_err());
    }
}
