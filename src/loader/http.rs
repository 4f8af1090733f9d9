//! HTTP Downloader
//!
//! Fetches image bytes over HTTP with separate deadlines for the response
//! headers and for the body. Retries are driven by the loader task, not here.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{DataSource, LoadingResult};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Download settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Deadline for the response headers
    pub header_timeout_secs: u64,

    /// Deadline for reading the whole body
    pub read_timeout_secs: u64,

    /// Extra attempts after a transient failure
    pub retry_count: u32,

    /// Pause between attempts
    pub retry_delay_ms: u64,

    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            header_timeout_secs: 10,
            read_timeout_secs: 30,
            retry_count: 3,
            retry_delay_ms: 250,
            user_agent: format!("imgload/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpConfig {
    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.header_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err(Error::Config(
                "HTTP timeouts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Downloader
// =============================================================================

/// [`DataSource`] for http(s) URLs
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: Client,
    header_timeout: Duration,
    read_timeout: Duration,
}

impl HttpDownloader {
    /// Create a downloader with its own client
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(client, config))
    }

    /// Create a downloader around an existing client
    pub fn with_client(client: Client, config: &HttpConfig) -> Self {
        Self {
            client,
            header_timeout: config.header_timeout(),
            read_timeout: config.read_timeout(),
        }
    }
}

#[async_trait]
impl DataSource for HttpDownloader {
    fn loading_result(&self) -> LoadingResult {
        LoadingResult::Internet
    }

    #[instrument(skip(self, token))]
    async fn fetch(&self, url: &str, token: &CancellationToken) -> Result<Bytes> {
        let request = self.client.get(url).send();
        let response = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            response = tokio::time::timeout(self.header_timeout, request) => match response {
                Ok(response) => response?,
                Err(_) => {
                    warn!("No response headers from {} within {:?}", url, self.header_timeout);
                    return Err(Error::HeaderTimeout {
                        url: url.to_string(),
                        timeout: self.header_timeout,
                    });
                }
            },
        };

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            body = tokio::time::timeout(self.read_timeout, response.bytes()) => match body {
                Ok(body) => body?,
                Err(_) => {
                    return Err(Error::ReadTimeout {
                        url: url.to_string(),
                        timeout: self.read_timeout,
                    });
                }
            },
        };

        if body.is_empty() {
            return Err(Error::Download {
                url: url.to_string(),
                reason: "empty response body".to_string(),
            });
        }

        debug!("Downloaded {} bytes from {}", body.len(), url);
        Ok(body)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Clone, Copy)]
    enum Reply {
        /// Write the response and close
        Complete(&'static str),
        /// Write the response, then hold the connection open
        Stall(&'static str),
        /// Never answer
        Silent,
    }

    /// Serve one canned reply per connection
    async fn serve(reply: Reply) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    match reply {
                        Reply::Complete(response) => {
                            let _ = socket.write_all(response.as_bytes()).await;
                            let _ = socket.shutdown().await;
                        }
                        Reply::Stall(response) => {
                            let _ = socket.write_all(response.as_bytes()).await;
                            let _ = socket.flush().await;
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                        Reply::Silent => tokio::time::sleep(Duration::from_secs(30)).await,
                    }
                });
            }
        });
        format!("http://{}/image.png", addr)
    }

    fn downloader(config: &HttpConfig) -> HttpDownloader {
        let client = Client::builder().no_proxy().build().unwrap();
        HttpDownloader::with_client(client, config)
    }

    #[tokio::test]
    async fn test_successful_download() {
        let url = serve(Reply::Complete(
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nimage",
        ))
        .await;
        let body = downloader(&HttpConfig::default())
            .fetch(&url, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(&body[..], b"image");
    }

    #[tokio::test]
    async fn test_status_error() {
        let url = serve(Reply::Complete(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ))
        .await;
        let result = downloader(&HttpConfig::default())
            .fetch(&url, &CancellationToken::new())
            .await;
        assert_matches!(result, Err(Error::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_empty_body_is_download_error() {
        let url = serve(Reply::Complete(
            "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ))
        .await;
        let result = downloader(&HttpConfig::default())
            .fetch(&url, &CancellationToken::new())
            .await;
        assert_matches!(result, Err(Error::Download { .. }));
    }

    #[tokio::test]
    async fn test_header_timeout() {
        let url = serve(Reply::Silent).await;
        let config = HttpConfig {
            header_timeout_secs: 1,
            ..Default::default()
        };
        let result = downloader(&config)
            .fetch(&url, &CancellationToken::new())
            .await;
        assert_matches!(result, Err(Error::HeaderTimeout { .. }));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let url = serve(Reply::Stall(
            "HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial",
        ))
        .await;
        let config = HttpConfig {
            read_timeout_secs: 1,
            ..Default::default()
        };
        let result = downloader(&config)
            .fetch(&url, &CancellationToken::new())
            .await;
        assert_matches!(&result, Err(Error::ReadTimeout { .. }));
        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_download() {
        let url = serve(Reply::Silent).await;
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let result = downloader(&HttpConfig::default()).fetch(&url, &token).await;
        assert_matches!(result, Err(Error::Cancelled));
    }

    #[test]
    fn test_config_validation() {
        assert!(HttpConfig::default().validate().is_ok());
        let config = HttpConfig {
            read_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
