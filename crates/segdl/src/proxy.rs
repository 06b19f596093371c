use reqwest::Proxy;

use crate::DownloadError;

/// Upstream proxy kinds.
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ProxyType {
    /// HTTP proxy
    Http,
    /// HTTPS proxy
    Https,
    /// SOCKS5 proxy
    Socks5,
}

/// Proxy credentials
#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g., "http://proxy.example.com:8080")
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    /// Guess the proxy type from the URL scheme, defaulting to HTTP.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let proxy_type = if url.starts_with("socks5://") || url.starts_with("socks5h://") {
            ProxyType::Socks5
        } else if url.starts_with("https://") {
            ProxyType::Https
        } else {
            ProxyType::Http
        };
        Self {
            url,
            proxy_type,
            auth: None,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }
}

/// Build a reqwest Proxy object from our proxy configuration
pub fn build_proxy_from_config(config: &ProxyConfig) -> Result<Proxy, DownloadError> {
    let proxy_url = &config.url;

    // Segment traffic is plain GETs of either scheme, so HTTP(S) proxies
    // intercept everything rather than only their own scheme.
    let mut proxy = match config.proxy_type {
        ProxyType::Http | ProxyType::Https => Proxy::all(proxy_url).map_err(|e| {
            DownloadError::proxy_configuration(format!("invalid HTTP proxy URL: {e}"))
        })?,
        ProxyType::Socks5 => {
            // Make sure URL starts with socks5:// or socks5h://
            let url = if proxy_url.starts_with("socks5://") || proxy_url.starts_with("socks5h://") {
                proxy_url.to_string()
            } else {
                format!("socks5://{proxy_url}")
            };

            Proxy::all(&url).map_err(|e| {
                DownloadError::proxy_configuration(format!("invalid SOCKS5 proxy URL: {e}"))
            })?
        }
    };

    if let Some(auth) = &config.auth {
        proxy = proxy.basic_auth(&auth.username, &auth.password);
    }

    Ok(proxy)
}
