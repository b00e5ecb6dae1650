use crate::engine::throughput::ByteCounter;
use crate::model::RunConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(StatusCode),

    #[error("rate limited (reset at {})", .reset.as_deref().unwrap_or("unknown"))]
    RateLimited { reset: Option<String> },

    #[error("malformed response body: {0}")]
    Body(String),
}

/// The three server contracts the measurement engine depends on.
#[async_trait]
pub trait SpeedEndpoint: Send + Sync + 'static {
    /// One round trip to the liveness endpoint, body fully read.
    async fn ping(&self) -> Result<(), EndpointError>;

    /// Streams one bounded download, adding every received chunk to `sink`
    /// as it arrives. Stops reading once `deadline` has passed.
    async fn download(
        &self,
        mb: u32,
        sink: &ByteCounter,
        deadline: Instant,
    ) -> Result<u64, EndpointError>;

    /// Posts `payload` and returns how many bytes the server says it read.
    async fn upload(&self, payload: Bytes) -> Result<u64, EndpointError>;
}

#[derive(Debug, Deserialize)]
struct UploadAck {
    #[serde(default, rename = "bytesReceived")]
    bytes_received: Option<u64>,
}

#[derive(Clone)]
pub struct HttpEndpoint {
    pub base_url: Url,
    ping_url: Url,
    download_url: Url,
    upload_url: Url,
    http: reqwest::Client,
}

/// `Url::join` drops the last path segment unless the base ends in `/`.
pub fn normalize_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).context("invalid base_url")?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

impl HttpEndpoint {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        let base_url = normalize_base_url(&cfg.base_url)?;

        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(Duration::from_secs(5))
            .tcp_keepalive(Duration::from_secs(15))
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            ping_url: base_url.join("ping").context("join ping")?,
            download_url: base_url.join("download").context("join download")?,
            upload_url: base_url.join("upload").context("join upload")?,
            base_url,
            http,
        })
    }

    pub fn download_url_for(&self, mb: u32) -> Url {
        let mut url = self.download_url.clone();
        url.query_pairs_mut().append_pair("mb", &mb.to_string());
        url
    }
}

fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, EndpointError> {
    let status = resp.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let reset = resp
            .headers()
            .get("retry-after")
            .or_else(|| resp.headers().get("x-ratelimit-reset"))
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        return Err(EndpointError::RateLimited { reset });
    }
    if !status.is_success() {
        return Err(EndpointError::Status(status));
    }
    Ok(resp)
}

#[async_trait]
impl SpeedEndpoint for HttpEndpoint {
    async fn ping(&self) -> Result<(), EndpointError> {
        let resp = self
            .http
            .get(self.ping_url.clone())
            .header(CACHE_CONTROL, "no-store")
            .send()
            .await?;
        let resp = check_status(resp)?;
        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| EndpointError::Body(e.to_string()))?;
        Ok(())
    }

    async fn download(
        &self,
        mb: u32,
        sink: &ByteCounter,
        deadline: Instant,
    ) -> Result<u64, EndpointError> {
        let resp = self
            .http
            .get(self.download_url_for(mb))
            .header(CACHE_CONTROL, "no-store")
            .header(ACCEPT_ENCODING, "identity")
            .send()
            .await?;
        let resp = check_status(resp)?;

        let mut received = 0u64;
        let mut stream = resp.bytes_stream();
        while Instant::now() < deadline {
            let Some(chunk) = stream.next().await else {
                break;
            };
            let chunk = chunk?;
            let n = chunk.len() as u64;
            sink.add(n);
            received += n;
        }
        Ok(received)
    }

    async fn upload(&self, payload: Bytes) -> Result<u64, EndpointError> {
        let sent = payload.len() as u64;
        let resp = self
            .http
            .post(self.upload_url.clone())
            .header(CACHE_CONTROL, "no-store")
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(payload)
            .send()
            .await?;
        let resp = check_status(resp)?;
        let ack: UploadAck = resp
            .json()
            .await
            .map_err(|e| EndpointError::Body(e.to_string()))?;
        Ok(ack.bytes_received.unwrap_or(sent))
    }
}
