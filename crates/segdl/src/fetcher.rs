// Segment Fetcher: one GET per segment, streamed into the segment buffer and
// classified into a tri-state outcome for the round loop.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::decryption::DecryptionAdapter;
use crate::error::TransportError;
use crate::limiter::HostLimiter;
use crate::model::Segment;
use crate::progress::ProgressMeter;
use crate::transport::Transport;

/// Short status tag attached to every outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchTag {
    Ok,
    Skip,
    StatusCodeError,
    HttpStatus,
    ReDownload,
    Exit,
    Timeout,
    Connect,
    Payload,
    Io,
    Disconnected,
    Persist,
    EmptyBody,
    Unknown,
}

impl FetchTag {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchTag::Ok => "OK",
            FetchTag::Skip => "STATUS_SKIP",
            FetchTag::StatusCodeError => "STATUS_CODE_ERROR",
            FetchTag::HttpStatus => "HTTP_STATUS",
            FetchTag::ReDownload => "RE-DOWNLOAD",
            FetchTag::Exit => "EXIT",
            FetchTag::Timeout => "TIMEOUT",
            FetchTag::Connect => "CONNECTION_ERROR",
            FetchTag::Payload => "PAYLOAD_ERROR",
            FetchTag::Io => "OS_ERROR",
            FetchTag::Disconnected => "SERVER_DISCONNECTED",
            FetchTag::Persist => "PERSIST_ERROR",
            FetchTag::EmptyBody => "EMPTY_BODY",
            FetchTag::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FetchTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Payload persisted and counted.
    Success { bytes: u64 },
    /// 403/404: present-but-unusable, target count already lowered.
    Skipped { status: u16 },
    /// Nothing kept; the next round may try again.
    Retryable(FetchTag),
    /// The stream cannot be completed this round; siblings must stop.
    Fatal(FetchTag),
}

impl FetchOutcome {
    pub fn tag(&self) -> FetchTag {
        match self {
            FetchOutcome::Success { .. } => FetchTag::Ok,
            FetchOutcome::Skipped { .. } => FetchTag::Skip,
            FetchOutcome::Retryable(tag) | FetchOutcome::Fatal(tag) => *tag,
        }
    }

    pub fn retains_bytes(&self) -> bool {
        matches!(self, FetchOutcome::Success { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchOutcome::Fatal(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchOutcome::Retryable(_))
    }
}

/// Where a fetch currently is; reported when it is cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Requesting,
    StreamingBody,
}

/// State shared by every fetch of one round.
#[derive(Clone, Copy)]
pub struct SegmentFetcher<'a> {
    pub transport: &'a dyn Transport,
    pub config: &'a EngineConfig,
    pub adapter: &'a DecryptionAdapter,
    pub limiter: &'a HostLimiter,
    pub progress: &'a Mutex<ProgressMeter>,
    /// Running byte total for the stream, fed by Content-Length or received bytes.
    pub filesize: &'a AtomicU64,
    pub token: &'a CancellationToken,
}

impl SegmentFetcher<'_> {
    pub async fn fetch(&self, segment: &mut Segment) -> FetchOutcome {
        let outcome = self.fetch_inner(segment).await;
        if !outcome.retains_bytes() {
            segment.clear_buffer();
        }
        outcome
    }

    async fn fetch_inner(&self, segment: &mut Segment) -> FetchOutcome {
        let url = self.config.base.patched_url(&segment.url);

        let _permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => return self.cancelled(segment, FetchState::Requesting),
            permit = self.limiter.acquire(&url) => permit,
        };

        trace!(segment = %segment.id, url = %url, "Requesting segment");
        let response = tokio::select! {
            biased;
            _ = self.token.cancelled() => return self.cancelled(segment, FetchState::Requesting),
            response = self.transport.get(&url) => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => return self.classify_error(segment, e),
        };

        let status = response.status.as_u16();
        match status {
            403 | 404 => {
                if status == 404 {
                    segment.max_retry_404 = segment.max_retry_404.saturating_sub(1);
                }
                segment.skip_concat = true;
                self.progress.lock().decrease_target_count();
                warn!(
                    segment = %segment.id,
                    status,
                    retry_404_left = segment.max_retry_404,
                    "Segment unavailable, skipping"
                );
                return FetchOutcome::Skipped { status };
            }
            405 => {
                error!(segment = %segment.id, url = %url, status, "Server rejected segment request");
                return FetchOutcome::Fatal(FetchTag::StatusCodeError);
            }
            s if self.config.re_download_statuses.contains(&s) => {
                debug!(segment = %segment.id, status, "Status marked for re-download");
                return FetchOutcome::Retryable(FetchTag::ReDownload);
            }
            _ if !response.status.is_success() => {
                debug!(segment = %segment.id, status, "Unexpected status, retrying next round");
                return FetchOutcome::Retryable(FetchTag::HttpStatus);
            }
            _ => {}
        }

        // A segment that 404'd in an earlier round is usable again once it answers.
        segment.skip_concat = false;

        let known_length = response.content_length;
        if let Some(len) = known_length {
            self.grow_filesize(len);
        }

        let mut credit = ByteCredit::new(self.progress);
        let mut body = response.body;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => return self.cancelled(segment, FetchState::StreamingBody),
                next = body.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    for piece in split_chunks(bytes, self.config.chunk_size) {
                        if self.token.is_cancelled() {
                            return self.cancelled(segment, FetchState::StreamingBody);
                        }
                        let n = piece.len() as u64;
                        segment.push_chunk(piece);
                        if known_length.is_none() {
                            self.grow_filesize(n);
                        }
                        credit.add(n);
                    }
                }
                Some(Err(e)) => return self.classify_error(segment, e),
                None => break,
            }
        }

        // An empty file would read as "not downloaded" on the next scan.
        if segment.buffered_len() == 0 {
            debug!(segment = %segment.id, status, "Empty body, retrying next round");
            return FetchOutcome::Retryable(FetchTag::EmptyBody);
        }

        match self.adapter.persist(segment).await {
            Ok(bytes) => {
                credit.keep();
                self.progress.lock().add_completed_segments(1);
                FetchOutcome::Success { bytes }
            }
            Err(e) => {
                warn!(segment = %segment.id, path = %segment.path.display(), error = %e, "Failed to persist segment");
                FetchOutcome::Retryable(FetchTag::Persist)
            }
        }
    }

    fn grow_filesize(&self, n: u64) {
        let total = self.filesize.fetch_add(n, Ordering::Relaxed) + n;
        self.progress.lock().set_target_bytes(total);
    }

    fn cancelled(&self, segment: &Segment, state: FetchState) -> FetchOutcome {
        debug!(segment = %segment.id, ?state, "Fetch cancelled");
        FetchOutcome::Fatal(FetchTag::Exit)
    }

    fn classify_error(&self, segment: &Segment, e: TransportError) -> FetchOutcome {
        let tag = match &e {
            TransportError::Timeout(_) => FetchTag::Timeout,
            TransportError::Connect(_) => FetchTag::Connect,
            TransportError::Payload(_) => FetchTag::Payload,
            TransportError::Io(_) => FetchTag::Io,
            TransportError::Disconnected(_) => FetchTag::Disconnected,
            TransportError::InvalidUrl(url) => {
                info!(segment = %segment.id, url = %url, "Invalid segment URL");
                return FetchOutcome::Fatal(FetchTag::Exit);
            }
            TransportError::Other(_) => {
                error!(segment = %segment.id, url = %segment.url, error = ?e, "Unexpected error while fetching segment");
                return FetchOutcome::Fatal(FetchTag::Unknown);
            }
        };
        debug!(segment = %segment.id, error = %e, "Transient fetch failure");
        FetchOutcome::Retryable(tag)
    }
}

/// Body bytes one fetch has reported to the meter. Unless kept, they are taken
/// back when the guard drops, including when the fetch future itself is dropped.
struct ByteCredit<'a> {
    progress: &'a Mutex<ProgressMeter>,
    bytes: u64,
    kept: bool,
}

impl<'a> ByteCredit<'a> {
    fn new(progress: &'a Mutex<ProgressMeter>) -> Self {
        Self {
            progress,
            bytes: 0,
            kept: false,
        }
    }

    fn add(&mut self, n: u64) {
        self.bytes += n;
        self.progress.lock().add_completed_bytes(n);
    }

    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for ByteCredit<'_> {
    fn drop(&mut self) {
        if !self.kept && self.bytes > 0 {
            self.progress.lock().retract_completed_bytes(self.bytes);
        }
    }
}

fn split_chunks(mut bytes: Bytes, size: usize) -> impl Iterator<Item = Bytes> {
    let size = size.max(1);
    std::iter::from_fn(move || {
        if bytes.is_empty() {
            None
        } else {
            Some(bytes.split_to(size.min(bytes.len())))
        }
    })
}
