#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("proxy configuration error: {reason}")]
    ProxyConfiguration { reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn proxy_configuration(reason: impl Into<String>) -> Self {
        Self::ProxyConfiguration {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }
}

/// Failure kinds a [`Transport`](crate::transport::Transport) can report.
///
/// The fetcher maps each kind onto a per-segment outcome, so transports only
/// need to say *what* went wrong, not whether it is worth retrying.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("payload error: {0}")]
    Payload(String),

    #[error("socket error: {0}")]
    Io(String),

    #[error("server disconnected: {0}")]
    Disconnected(String),

    #[error("invalid URL `{0}`")]
    InvalidUrl(String),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let detail = e.to_string();
        if e.is_builder() {
            let url = e.url().map(|u| u.to_string()).unwrap_or(detail);
            Self::InvalidUrl(url)
        } else if e.is_timeout() {
            Self::Timeout(detail)
        } else if e.is_connect() {
            Self::Connect(detail)
        } else if e.is_body() || e.is_decode() {
            Self::Payload(detail)
        } else if e.is_request() {
            Self::Disconnected(detail)
        } else if has_io_source(&e) {
            Self::Io(detail)
        } else {
            Self::Other(detail)
        }
    }
}

fn has_io_source(e: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = e.source();
    while let Some(err) = source {
        if err.is::<std::io::Error>() {
            return true;
        }
        source = err.source();
    }
    false
}

/// Errors raised by a [`SegmentCipher`](crate::decryption::SegmentCipher).
#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid IV `{0}`")]
    InvalidIv(String),

    #[error("cipher failure: {0}")]
    Cipher(String),
}

impl From<DecryptError> for DownloadError {
    fn from(err: DecryptError) -> Self {
        DownloadError::Decryption {
            reason: err.to_string(),
        }
    }
}
