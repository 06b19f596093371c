//! # segdl-engine
//!
//! Concurrent, resumable download engine for segmented media streams.
//!
//! A [`Stream`] is an ordered list of [`Segment`]s, each with a URL and an
//! output path. [`Downloader::download_stream`] scans the disk for segments a
//! previous run already finished, fetches the rest concurrently, and repeats in
//! bounded rounds until nothing retryable is left. Each fetch ends in one of
//! three shapes: success or skip, retry next round, or fatal, which cancels
//! the other fetches of that round.
//!
//! ```no_run
//! use segdl_engine::{Downloader, EngineConfig, Segment, Stream};
//!
//! # async fn run() -> Result<(), segdl_engine::DownloadError> {
//! let downloader = Downloader::new(EngineConfig::default().with_max_rounds(3))?;
//! let mut stream = Stream::new(
//!     "video",
//!     vec![Segment::new(0, "https://cdn.example/v/0.ts", "out/v_000.ts")],
//! );
//! let report = downloader.download_stream(&mut stream).await;
//! assert!(report.is_complete());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod decryption;
pub mod downloader;
pub mod error;
pub mod fetcher;
pub mod limiter;
pub mod model;
pub mod postprocess;
pub mod progress;
pub mod proxy;
pub mod report;
pub mod resume;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use config::{DownloaderConfig, EngineConfig, HttpVersionPreference, LiveOptions};
pub use decryption::{AesCbcCipher, DecryptionAdapter, SegmentCipher};
pub use downloader::Downloader;
pub use error::{DecryptError, DownloadError, TransportError};
pub use fetcher::{FetchOutcome, FetchTag, SegmentFetcher};
pub use model::{EncryptionInfo, EncryptionMethod, Segment, SegmentId, Stream, StreamModel};
pub use postprocess::{NoopPostProcessor, PostProcessor};
pub use progress::{ProgressDisplay, ProgressMeter, ProgressState};
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use report::{SegmentStatus, SessionReport, StreamReport, StreamVerdict};
pub use resume::{ResumeScanner, ScanResult};
pub use transport::{
    HttpTransport, HttpTransportFactory, Transport, TransportFactory, TransportResponse,
    create_client,
};
