use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{AssetFetchError, RelayError, RelayResult};
use crate::gradio::ImageDescriptor;

/// One downloaded image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    /// Path of the file on the image server
    pub filename: String,
    pub bytes: Bytes,
}

/// Downloads generated files from the image server's `/file=` route
pub struct AssetFetcher {
    client: Client,
    host: String,
}

impl AssetFetcher {
    pub fn new(host: impl Into<String>, timeout: Duration) -> RelayResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Config {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            host: host.into(),
        })
    }

    pub fn file_url(&self, filename: &str) -> String {
        format!("http://{}/file={}", self.host, filename)
    }

    /// Download every image in order. The first failure aborts the batch.
    pub async fn fetch_all(&self, images: &[ImageDescriptor]) -> RelayResult<Vec<GeneratedImage>> {
        let mut downloaded = Vec::with_capacity(images.len());

        for image in images {
            if !image.is_file {
                debug!(filename = %image.filename, "Descriptor not flagged as a file, fetching anyway");
            }
            let bytes = self
                .fetch(&image.filename)
                .await
                .map_err(|source| {
                    warn!(filename = %image.filename, error = %source, "Image download failed");
                    RelayError::AssetFetch {
                        filename: image.filename.clone(),
                        source,
                    }
                })?;

            downloaded.push(GeneratedImage {
                filename: image.filename.clone(),
                bytes,
            });
        }

        Ok(downloaded)
    }

    async fn fetch(&self, filename: &str) -> Result<Bytes, AssetFetchError> {
        let url = self.file_url(filename);
        debug!(url = %url, "Fetching image");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AssetFetchError::Status {
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        debug!(url = %url, size = bytes.len(), "Fetched image");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn descriptor(name: &str) -> ImageDescriptor {
        ImageDescriptor {
            filename: name.to_string(),
            is_file: true,
        }
    }

    fn fetcher(server: &MockServer) -> AssetFetcher {
        AssetFetcher::new(server.address().to_string(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_file_url() {
        let fetcher = AssetFetcher::new("10.0.0.2:7861", Duration::from_secs(1)).unwrap();
        assert_eq!(
            fetcher.file_url("/tmp/out/a.png"),
            "http://10.0.0.2:7861/file=/tmp/out/a.png"
        );
    }

    #[tokio::test]
    async fn test_fetch_all_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file=a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"first".to_vec()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file=b.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"second".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let images = fetcher(&server)
            .fetch_all(&[descriptor("a.png"), descriptor("b.png")])
            .await
            .unwrap();

        assert_eq!(images.len(), 2);
        assert_eq!(images[0].filename, "a.png");
        assert_eq!(images[0].bytes, Bytes::from_static(b"first"));
        assert_eq!(images[1].filename, "b.png");
        assert_eq!(images[1].bytes, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn test_first_failure_aborts_batch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file=a.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"first".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file=missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file=c.png"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = fetcher(&server)
            .fetch_all(&[
                descriptor("a.png"),
                descriptor("missing.png"),
                descriptor("c.png"),
            ])
            .await
            .unwrap_err();

        match err {
            RelayError::AssetFetch { filename, source } => {
                assert_eq!(filename, "missing.png");
                assert!(matches!(source, AssetFetchError::Status { status: 404 }));
            }
            other => panic!("Expected AssetFetch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let host = listener.local_addr().unwrap().to_string();
        drop(listener);

        let fetcher = AssetFetcher::new(host, Duration::from_secs(5)).unwrap();
        let err = fetcher.fetch_all(&[descriptor("a.png")]).await.unwrap_err();

        assert!(matches!(
            err,
            RelayError::AssetFetch {
                source: AssetFetchError::Request(_),
                ..
            }
        ));
    }
}
