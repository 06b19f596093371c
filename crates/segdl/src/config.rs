use std::collections::HashSet;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::DownloadError;
use crate::proxy::ProxyConfig;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Bytes read per body chunk. Small so the progress line stays responsive.
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Upper bound on retry rounds per stream.
pub const DEFAULT_MAX_ROUNDS: u32 = 5;

/// HTTP version preference for connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HttpVersionPreference {
    /// Let ALPN negotiate the best version (default)
    #[default]
    Auto,
    Http2Only,
    /// Force HTTP/1.1 only (disable HTTP/2)
    Http1Only,
}

/// HTTP-level options shared by every segment request.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Overall timeout for a single segment request; zero disables it
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    pub follow_redirects: bool,

    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,

    /// Query parameters appended to every segment URL
    pub params: Vec<(String, String)>,

    /// Raw suffix appended to every segment URL before the request is built
    pub url_patch: Option<String>,

    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,

    pub danger_accept_invalid_certs: bool,

    pub http_version: HttpVersionPreference,

    /// Maximum concurrent connections per host. `0` means unlimited.
    pub max_connections_per_host: usize,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,

    pub pool_idle_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(0),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            params: Vec::new(),
            url_patch: None,
            proxy: None,
            use_system_proxy: true,
            danger_accept_invalid_certs: false,
            http_version: HttpVersionPreference::Auto,
            max_connections_per_host: 16,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl DownloaderConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate, br"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5,zh-CN;q=0.3,zh;q=0.2"),
        );
        default_headers
    }

    /// Insert or replace a header. Invalid names or values are ignored with a warning.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => tracing::warn!(header = name, "Ignoring invalid header"),
        }
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_url_patch(mut self, patch: impl Into<String>) -> Self {
        self.url_patch = Some(patch.into());
        self
    }

    pub fn with_max_connections_per_host(mut self, limit: usize) -> Self {
        self.max_connections_per_host = limit;
        self
    }

    /// Final request URL for a segment: the manifest URL plus the configured patch.
    pub fn patched_url(&self, url: &str) -> String {
        match &self.url_patch {
            Some(patch) if !patch.is_empty() => format!("{url}{patch}"),
            _ => url.to_string(),
        }
    }
}

/// Live-recording behavior for a download session.
#[derive(Debug, Clone, Default)]
pub struct LiveOptions {
    pub enabled: bool,
    /// Raise the stop-recording signal once any stream has recorded this much.
    pub record_limit: Option<Duration>,
}

/// Everything the engine needs besides the streams themselves.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base: DownloaderConfig,
    pub max_rounds: u32,
    /// Statuses that discard the attempt and re-queue the segment for the next round.
    pub re_download_statuses: HashSet<u16>,
    pub chunk_size: usize,
    /// When false, buffered bytes are written unmodified even for encrypted segments.
    pub decrypt: bool,
    /// Run the cipher on the blocking thread pool instead of inline.
    pub offload_decryption: bool,
    pub disable_concat: bool,
    pub live: LiveOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base: DownloaderConfig::default(),
            max_rounds: DEFAULT_MAX_ROUNDS,
            re_download_statuses: HashSet::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            decrypt: true,
            offload_decryption: false,
            disable_concat: false,
            live: LiveOptions::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_base(mut self, base: DownloaderConfig) -> Self {
        self.base = base;
        self
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    pub fn with_re_download_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.re_download_statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_decrypt(mut self, decrypt: bool) -> Self {
        self.decrypt = decrypt;
        self
    }

    pub fn with_offload_decryption(mut self, offload: bool) -> Self {
        self.offload_decryption = offload;
        self
    }

    pub fn with_disable_concat(mut self, disable: bool) -> Self {
        self.disable_concat = disable;
        self
    }

    pub fn with_live(mut self, live: LiveOptions) -> Self {
        self.live = live;
        self
    }

    /// Reject settings the round loop cannot run with.
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.max_rounds == 0 {
            return Err(DownloadError::configuration("max_rounds must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(DownloadError::configuration("chunk_size must be at least 1"));
        }
        if self.live.record_limit.is_some() && !self.live.enabled {
            return Err(DownloadError::configuration(
                "record_limit only applies to live sessions",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_headers_override_defaults() {
        let config = DownloaderConfig::default()
            .with_header("accept", "video/mp2t")
            .with_header("referer", "https://example.com/");
        assert_eq!(config.headers["accept"], "video/mp2t");
        assert_eq!(config.headers["referer"], "https://example.com/");
        assert!(config.headers.contains_key("accept-language"));
    }

    #[test]
    fn url_patch_is_appended_verbatim() {
        let config = DownloaderConfig::default().with_url_patch("?token=abc");
        assert_eq!(
            config.patched_url("https://cdn/seg1.ts"),
            "https://cdn/seg1.ts?token=abc"
        );
        assert_eq!(
            DownloaderConfig::default().patched_url("https://cdn/seg1.ts"),
            "https://cdn/seg1.ts"
        );
    }

    #[test]
    fn rounds_never_drop_to_zero() {
        assert_eq!(EngineConfig::default().with_max_rounds(0).max_rounds, 1);
        assert_eq!(EngineConfig::default().max_rounds, DEFAULT_MAX_ROUNDS);
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        assert!(EngineConfig::default().validate().is_ok());

        let mut config = EngineConfig::default();
        config.chunk_size = 0;
        assert!(matches!(
            config.validate(),
            Err(DownloadError::Configuration { .. })
        ));

        let config = EngineConfig::default().with_live(LiveOptions {
            enabled: false,
            record_limit: Some(Duration::from_secs(10)),
        });
        assert!(config.validate().is_err());
    }
}
