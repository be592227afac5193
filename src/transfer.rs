use std::fs::File;
use std::path::Path;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::debug;

use crate::error::IngestError;

/// Retrieval of open-access payloads, which the lookup API hands out as
/// `ftp://` URIs.
pub trait FileTransfer: Send + Sync {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, IngestError>;
}

/// Fetches NCBI FTP paths through the HTTPS mirror that serves the same tree.
#[derive(Clone)]
pub struct HttpMirrorTransfer {
    client: Client,
}

impl HttpMirrorTransfer {
    pub fn new() -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("pubmed-ingest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IngestError::TransferHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| IngestError::TransferHttp(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn normalize_url(url: &str) -> String {
        if let Some(rest) = url.strip_prefix("ftp://ftp.ncbi.nlm.nih.gov/") {
            return format!("https://ftp.ncbi.nlm.nih.gov/{rest}");
        }
        url.to_string()
    }

    fn write_response_to_file(
        &self,
        mut response: reqwest::blocking::Response,
        destination: &Path,
    ) -> Result<u64, IngestError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "file transfer failed".to_string());
            return Err(IngestError::TransferStatus { status, message });
        }
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
        let mut file =
            File::create(destination).map_err(|err| IngestError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| IngestError::TransferHttp(err.to_string()))
    }
}

impl FileTransfer for HttpMirrorTransfer {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, IngestError> {
        let url = Self::normalize_url(url);
        if !url.starts_with("https://") && !url.starts_with("http://") {
            return Err(IngestError::TransferHttp(format!(
                "no HTTP mirror for {url}"
            )));
        }
        let start = Instant::now();
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| IngestError::TransferHttp(err.to_string()))?;
        let bytes = self.write_response_to_file(response, destination)?;
        debug!(
            url = %url,
            bytes,
            latency_ms = start.elapsed().as_millis() as u64,
            "transfer.complete"
        );
        Ok(bytes)
    }
}
