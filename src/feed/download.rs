use async_trait::async_trait;
use futures::StreamExt;
use reqwest::redirect::Policy;
use std::time::Duration;
use thiserror::Error;

/// Default response size cap (10 MiB).
pub const DEFAULT_MAX_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while downloading a feed or image.
///
/// Nothing here is retried internally; the refresh scheduler's backoff takes
/// care of retrying on a later round.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),

    #[error("Request timed out")]
    Timeout,

    #[error("Response too large")]
    ResponseTooLarge,

    /// Received fewer bytes than Content-Length announced.
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// A completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub bytes: Vec<u8>,
    /// Essence of the Content-Type header (`image/png`), lowercased.
    pub mime_type: Option<String>,
}

impl Download {
    pub fn is_image(&self) -> bool {
        self.mime_type
            .as_deref()
            .is_some_and(|mime| mime.starts_with("image/"))
    }
}

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, url: &str) -> Result<Download, DownloadError>;
}

/// `reqwest`-backed downloader with a timeout and a response size cap.
#[derive(Clone)]
pub struct ReqwestDownloader {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: usize,
}

impl ReqwestDownloader {
    pub fn new(user_agent: &str, timeout: Duration, max_bytes: usize) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(redirect_policy())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        Ok(Self::with_client(client, timeout, max_bytes))
    }

    pub fn with_client(client: reqwest::Client, timeout: Duration, max_bytes: usize) -> Self {
        Self {
            client,
            timeout,
            max_bytes,
        }
    }
}

#[async_trait]
impl Downloader for ReqwestDownloader {
    async fn download(&self, url: &str) -> Result<Download, DownloadError> {
        let fetch = async {
            let response = self.client.get(url).send().await?;
            if !response.status().is_success() {
                return Err(DownloadError::HttpStatus(response.status().as_u16()));
            }
            let mime_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(';').next())
                .map(|essence| essence.trim().to_ascii_lowercase())
                .filter(|essence| !essence.is_empty());
            let bytes = read_limited_bytes(response, self.max_bytes).await?;
            Ok::<_, DownloadError>(Download { bytes, mime_type })
        };

        let download = tokio::time::timeout(self.timeout, fetch)
            .await
            .map_err(|_| DownloadError::Timeout)??;
        tracing::debug!(
            url = %url,
            bytes = download.bytes.len(),
            mime = download.mime_type.as_deref().unwrap_or("unknown"),
            "Downloaded"
        );
        Ok(download)
    }
}

fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        for prev in attempt.previous() {
            if prev.as_str() == url.as_str() {
                return attempt.error("Redirect loop detected");
            }
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, DownloadError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(DownloadError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(DownloadError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(DownloadError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn downloader(max_bytes: usize, timeout: Duration) -> ReqwestDownloader {
        ReqwestDownloader::new("feedsync-test", timeout, max_bytes).unwrap()
    }

    #[tokio::test]
    async fn test_download_reports_mime_essence() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/logo.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "Image/PNG; charset=binary")
                    .set_body_bytes(vec![0x89, b'P', b'N', b'G']),
            )
            .mount(&server)
            .await;

        let download = downloader(DEFAULT_MAX_BYTES, DEFAULT_TIMEOUT)
            .download(&format!("{}/logo.png", server.uri()))
            .await
            .unwrap();
        assert_eq!(download.mime_type.as_deref(), Some("image/png"));
        assert!(download.is_image());
        assert_eq!(download.bytes.len(), 4);
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = downloader(DEFAULT_MAX_BYTES, DEFAULT_TIMEOUT)
            .download(&format!("{}/missing.xml", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::HttpStatus(404)));
    }

    #[tokio::test]
    async fn test_size_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 2048]))
            .mount(&server)
            .await;

        let err = downloader(1024, DEFAULT_TIMEOUT)
            .download(&format!("{}/big.xml", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::ResponseTooLarge));
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let err = downloader(DEFAULT_MAX_BYTES, Duration::from_millis(100))
            .download(&format!("{}/slow.xml", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Timeout));
    }
}
