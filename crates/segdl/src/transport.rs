//! The GET-with-streaming-body seam the fetcher talks to, and its reqwest implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client, StatusCode, redirect};
use tracing::debug;
use url::Url;

use crate::config::{DownloaderConfig, HttpVersionPreference};
use crate::error::{DownloadError, TransportError};
use crate::proxy::build_proxy_from_config;

pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

pub struct TransportResponse {
    pub status: StatusCode,
    pub content_length: Option<u64>,
    pub body: BodyStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET and resolve once response headers are in.
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError>;
}

/// Produces one transport per round. Dropping it releases its connection pool.
pub trait TransportFactory: Send + Sync {
    fn open(&self) -> Result<Arc<dyn Transport>, DownloadError>;
}

pub fn create_client(config: &DownloaderConfig) -> Result<Client, DownloadError> {
    let mut builder = Client::builder()
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .danger_accept_invalid_certs(config.danger_accept_invalid_certs)
        .redirect(if config.follow_redirects {
            redirect::Policy::limited(10)
        } else {
            redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        builder = builder.timeout(config.timeout);
    }

    match config.http_version {
        HttpVersionPreference::Auto => {}
        HttpVersionPreference::Http2Only => builder = builder.http2_prior_knowledge(),
        HttpVersionPreference::Http1Only => builder = builder.http1_only(),
    }

    if let Some(proxy_config) = &config.proxy {
        debug!(proxy = %proxy_config.url, kind = ?proxy_config.proxy_type, "Using upstream proxy");
        builder = builder.proxy(build_proxy_from_config(proxy_config)?);
    } else if !config.use_system_proxy {
        builder = builder.no_proxy();
    }

    Ok(builder.build()?)
}

pub struct HttpTransport {
    client: Client,
    params: Vec<(String, String)>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(client: Client, config: &DownloaderConfig) -> Self {
        Self {
            client,
            params: config.params.clone(),
            timeout: config.timeout,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
        let parsed =
            Url::parse(url).map_err(|e| TransportError::InvalidUrl(format!("{url}: {e}")))?;

        let mut request = self.client.get(parsed).query(&self.params);
        if !self.timeout.is_zero() {
            request = request.timeout(self.timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed();

        Ok(TransportResponse {
            status,
            content_length,
            body,
        })
    }
}

/// Builds a fresh reqwest client (and pool) for every round.
pub struct HttpTransportFactory {
    config: DownloaderConfig,
}

impl HttpTransportFactory {
    pub fn new(config: DownloaderConfig) -> Result<Self, DownloadError> {
        // Fail fast on a bad proxy or TLS setup instead of at the first round.
        create_client(&config)?;
        Ok(Self { config })
    }
}

impl TransportFactory for HttpTransportFactory {
    fn open(&self) -> Result<Arc<dyn Transport>, DownloadError> {
        let client = create_client(&self.config)?;
        Ok(Arc::new(HttpTransport::new(client, &self.config)))
    }
}
