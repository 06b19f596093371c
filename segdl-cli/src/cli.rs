use std::path::PathBuf;

use clap::Parser;
use segdl_engine::ProxyType;

#[derive(Parser, Debug)]
#[command(
    name = "segdl",
    version,
    about = "Download segmented media streams described by a JSON manifest"
)]
pub struct Args {
    /// JSON file holding one stream or an array of streams
    #[arg(required = true)]
    pub input: PathBuf,

    /// Extra request header, `Name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Query parameter appended to every segment URL, `key=value` (repeatable)
    #[arg(long = "param")]
    pub params: Vec<String>,

    /// Raw suffix appended to every segment URL
    #[arg(long)]
    pub url_patch: Option<String>,

    /// Proxy URL (http, https or socks5)
    #[arg(long)]
    pub proxy: Option<String>,

    /// Override the proxy type guessed from the URL scheme
    #[arg(long, value_enum)]
    pub proxy_type: Option<ProxyType>,

    #[arg(long, requires = "proxy")]
    pub proxy_username: Option<String>,

    #[arg(long, requires = "proxy")]
    pub proxy_password: Option<String>,

    /// Do not fall back to the system proxy settings
    #[arg(long)]
    pub no_system_proxy: bool,

    /// Maximum download rounds per stream
    #[arg(long, default_value_t = segdl_engine::config::DEFAULT_MAX_ROUNDS)]
    pub max_rounds: u32,

    /// Concurrent connections per host, 0 for unlimited
    #[arg(long, default_value_t = 16)]
    pub connections_per_host: usize,

    /// HTTP status that re-queues a segment for the next round (repeatable)
    #[arg(long = "re-download-status")]
    pub re_download_statuses: Vec<u16>,

    /// Per-request timeout in seconds, 0 to disable
    #[arg(long, default_value_t = 0)]
    pub timeout: u64,

    /// Write encrypted segments as received
    #[arg(long)]
    pub no_decrypt: bool,

    /// Decrypt on the blocking thread pool
    #[arg(long)]
    pub offload_decryption: bool,

    /// Leave segments as separate files
    #[arg(long)]
    pub disable_concat: bool,

    /// Treat the session as a live recording
    #[arg(long)]
    pub live: bool,

    /// Stop a live session after this many seconds of recorded media
    #[arg(long, requires = "live")]
    pub record_limit: Option<u64>,

    /// Show a progress spinner per round
    #[arg(long)]
    pub progress: bool,

    /// Compact JSON report instead of pretty-printed
    #[arg(long)]
    pub compact: bool,

    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    #[arg(short, long)]
    pub quiet: bool,
}
