// Download orchestrator: bounded retry rounds per stream, one fetch future per
// pending segment, fan-in of outcomes, then post-round actions.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::EngineConfig;
use crate::decryption::{AesCbcCipher, DecryptionAdapter, SegmentCipher};
use crate::error::DownloadError;
use crate::fetcher::{FetchOutcome, FetchTag, SegmentFetcher};
use crate::limiter::HostLimiter;
use crate::model::{SegmentId, Stream};
use crate::postprocess::{NoopPostProcessor, PostProcessor};
use crate::progress::{ProgressDisplay, ProgressMeter, ProgressState};
use crate::report::{SegmentStatus, SessionReport, StreamReport, StreamVerdict};
use crate::resume::{ResumeScanner, ScanResult};
use crate::transport::{HttpTransportFactory, TransportFactory};

/// How a single round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundVerdict {
    /// Every fetched segment succeeded or was skipped.
    Done,
    /// At least one segment is worth another round.
    Retry,
    Fatal(FetchTag),
}

#[derive(Debug)]
struct RoundResult {
    verdict: RoundVerdict,
    outcomes: Vec<(SegmentId, FetchOutcome)>,
    persisted_bytes: u64,
    /// Meter state after `finish()`.
    progress: ProgressState,
}

pub struct Downloader {
    config: Arc<EngineConfig>,
    factory: Arc<dyn TransportFactory>,
    adapter: DecryptionAdapter,
    post: Arc<dyn PostProcessor>,
    limiter: HostLimiter,
    token: CancellationToken,
    display: ProgressDisplay,
    stop_signalled: AtomicBool,
}

impl Downloader {
    /// Engine backed by reqwest, honouring the proxy and header settings in `config.base`.
    pub fn new(config: EngineConfig) -> Result<Self, DownloadError> {
        config.validate()?;
        let factory = Arc::new(HttpTransportFactory::new(config.base.clone())?);
        Ok(Self::with_transport(config, factory))
    }

    pub fn with_transport(config: EngineConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let adapter = DecryptionAdapter::new(Arc::new(AesCbcCipher), &config);
        let limiter = HostLimiter::new(config.base.max_connections_per_host);
        Self {
            config: Arc::new(config),
            factory,
            adapter,
            post: Arc::new(NoopPostProcessor),
            limiter,
            token: CancellationToken::new(),
            display: ProgressDisplay::default(),
            stop_signalled: AtomicBool::new(false),
        }
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn SegmentCipher>) -> Self {
        self.adapter = DecryptionAdapter::new(cipher, &self.config);
        self
    }

    pub fn with_post_processor(mut self, post: Arc<dyn PostProcessor>) -> Self {
        self.post = post;
        self
    }

    pub fn with_progress(mut self, display: ProgressDisplay) -> Self {
        self.display = display;
        self
    }

    /// Share an externally owned token, e.g. one cancelled by a signal handler.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether a live stream has reached the configured record limit.
    pub fn stop_requested(&self) -> bool {
        self.stop_signalled.load(Ordering::Acquire)
    }

    /// Download every stream in order. A stream that aborts does not stop the
    /// others; cancellation of the session token does.
    pub async fn download_streams(&self, streams: &mut [Stream]) -> SessionReport {
        let mut report = SessionReport::default();
        for stream in streams.iter_mut() {
            if self.token.is_cancelled() {
                info!(stream = %stream.name, "Session cancelled, not starting stream");
                break;
            }
            report.streams.push(self.download_stream(stream).await);
        }
        report.stop_recording = self.stop_requested();
        report.interrupted = self.token.is_cancelled() && !report.stop_recording;
        report
    }

    pub async fn download_stream(&self, stream: &mut Stream) -> StreamReport {
        let mut outcomes: BTreeMap<SegmentId, SegmentStatus> = stream
            .segments
            .iter()
            .map(|s| (s.id, SegmentStatus::Pending))
            .collect();
        let mut rounds = 0u32;
        let mut downloaded_bytes = 0u64;
        let mut target_count = stream.segments.len() as u64;
        let mut progress_bytes = 0u64;

        let verdict = loop {
            if let Some(id) = stream.duplicate_id() {
                error!(stream = %stream.name, segment = %id, "Segment id used more than once");
                break StreamVerdict::Aborted(FetchTag::Unknown);
            }
            if self.token.is_cancelled() {
                break StreamVerdict::Aborted(FetchTag::Exit);
            }

            let scan = match ResumeScanner::scan(stream).await {
                Ok(scan) => scan,
                Err(e) => {
                    error!(stream = %stream.name, error = %e, "Resume scan failed");
                    break StreamVerdict::Aborted(FetchTag::Io);
                }
            };
            downloaded_bytes = scan.completed_bytes;
            progress_bytes = scan.completed_bytes;

            let pending: HashSet<usize> = scan.pending.iter().copied().collect();
            let mut fetchable = Vec::with_capacity(scan.pending.len());
            let mut exhausted = 0u64;
            for (index, segment) in stream.segments.iter_mut().enumerate() {
                let status = if !pending.contains(&index) {
                    SegmentStatus::Completed
                } else if segment.is_exhausted() {
                    segment.skip_concat = true;
                    exhausted += 1;
                    SegmentStatus::Skipped
                } else {
                    fetchable.push(index);
                    continue;
                };
                outcomes.insert(segment.id, status);
            }

            target_count = stream.segments.len() as u64 - exhausted;
            if fetchable.is_empty() {
                break StreamVerdict::Complete;
            }
            if rounds >= self.config.max_rounds {
                warn!(
                    stream = %stream.name,
                    rounds,
                    pending = fetchable.len(),
                    "Round budget exhausted with segments still pending"
                );
                break StreamVerdict::Incomplete;
            }
            rounds += 1;

            let round = match self
                .run_round(stream, &fetchable, target_count, &scan, rounds)
                .await
            {
                Ok(round) => round,
                Err(e) => {
                    error!(stream = %stream.name, round = rounds, error = %e, "Could not start round");
                    break StreamVerdict::Aborted(FetchTag::Unknown);
                }
            };

            downloaded_bytes += round.persisted_bytes;
            target_count = round.progress.target_count;
            progress_bytes = round.progress.completed_bytes;
            let interrupted = self.token.is_cancelled();
            for (id, outcome) in &round.outcomes {
                let status = match outcome {
                    FetchOutcome::Success { .. } => SegmentStatus::Completed,
                    FetchOutcome::Skipped { .. } => SegmentStatus::Skipped,
                    FetchOutcome::Retryable(_) => SegmentStatus::Pending,
                    // Cut short by the session token: worth fetching again later.
                    FetchOutcome::Fatal(FetchTag::Exit) if interrupted => SegmentStatus::Pending,
                    FetchOutcome::Fatal(_) => SegmentStatus::Failed,
                };
                outcomes.insert(*id, status);
            }

            match round.verdict {
                RoundVerdict::Done => break StreamVerdict::Complete,
                RoundVerdict::Fatal(tag) => {
                    error!(stream = %stream.name, round = rounds, tag = %tag, "Stream aborted");
                    break StreamVerdict::Aborted(tag);
                }
                RoundVerdict::Retry => {
                    debug!(stream = %stream.name, round = rounds, "Segments left over, starting another round");
                }
            }
        };

        let recorded_duration: f64 = stream
            .segments
            .iter()
            .filter(|s| outcomes.get(&s.id) == Some(&SegmentStatus::Completed))
            .map(|s| s.duration)
            .sum();

        let report = StreamReport {
            stream: stream.name.clone(),
            rounds,
            verdict,
            outcomes,
            downloaded_bytes,
            target_count,
            progress_bytes,
            recorded_duration,
        };

        info!(
            stream = %report.stream,
            rounds = report.rounds,
            verdict = ?report.verdict,
            completed = report.count(SegmentStatus::Completed),
            skipped = report.count(SegmentStatus::Skipped),
            pending = report.count(SegmentStatus::Pending),
            "Stream pass finished"
        );

        self.finish_stream(stream, &report).await;
        report
    }

    async fn run_round(
        &self,
        stream: &mut Stream,
        fetchable: &[usize],
        target_count: u64,
        scan: &ScanResult,
        round: u32,
    ) -> Result<RoundResult, DownloadError> {
        // Dropped at the end of this function, taking its connection pool with it.
        let transport = self.factory.open()?;
        let round_token = self.token.child_token();

        let span = self.display.span(&stream.name, round);
        let mut meter = ProgressMeter::with_span(
            format!("{} r{}", stream.name, round),
            target_count,
            span.clone(),
        );
        meter.resume_from(scan.completed_count, scan.completed_bytes);
        let progress = Mutex::new(meter);
        let filesize = AtomicU64::new(scan.completed_bytes);

        debug!(
            stream = %stream.name,
            round,
            fetching = fetchable.len(),
            already_done = scan.completed_count,
            "Starting round"
        );

        let fetcher = SegmentFetcher {
            transport: transport.as_ref(),
            config: &self.config,
            adapter: &self.adapter,
            limiter: &self.limiter,
            progress: &progress,
            filesize: &filesize,
            token: &round_token,
        };

        let wanted: HashSet<usize> = fetchable.iter().copied().collect();
        let mut outcomes = Vec::with_capacity(fetchable.len());
        let fatal = async {
            let mut tasks = FuturesUnordered::new();
            for (index, segment) in stream.segments.iter_mut().enumerate() {
                if !wanted.contains(&index) {
                    continue;
                }
                tasks.push(async move {
                    let id = segment.id;
                    (id, fetcher.fetch(segment).await)
                });
            }

            while let Some((id, outcome)) = tasks.next().await {
                outcomes.push((id, outcome));
                if outcome.is_fatal() {
                    // Stop collecting first, then cancel; unfinished fetches are
                    // dropped with `tasks` without reporting anything.
                    round_token.cancel();
                    debug!(stream = %stream.name, unfinished = tasks.len(), "Cancelling sibling fetches");
                    return Some(outcome.tag());
                }
            }
            None
        }
        .instrument(span)
        .await;

        for &index in fetchable {
            stream.segments[index].clear_buffer();
        }

        let progress = {
            let mut meter = progress.lock();
            meter.finish();
            meter.state().clone()
        };
        stream.filesize = filesize.load(Ordering::Relaxed);

        let persisted_bytes = outcomes
            .iter()
            .map(|(_, o)| match o {
                FetchOutcome::Success { bytes } => *bytes,
                _ => 0,
            })
            .sum();

        let verdict = match fatal {
            Some(tag) => RoundVerdict::Fatal(tag),
            None if outcomes.iter().any(|(_, o)| o.is_retryable()) => RoundVerdict::Retry,
            None => RoundVerdict::Done,
        };

        Ok(RoundResult {
            verdict,
            outcomes,
            persisted_bytes,
            progress,
        })
    }

    async fn finish_stream(&self, stream: &Stream, report: &StreamReport) {
        if stream.model.requires_header_fixup() && report.count(SegmentStatus::Completed) > 0 {
            if let Err(e) = self.post.fix_header(stream).await {
                error!(stream = %stream.name, error = %e, "Header fix-up failed");
            }
        }

        let live = &self.config.live;
        if report.is_complete() && !self.config.disable_concat && !live.enabled {
            if let Err(e) = self.post.concat(stream).await {
                error!(stream = %stream.name, error = %e, "Concatenation failed");
            }
        }

        if live.enabled {
            if let Some(limit) = live.record_limit {
                if report.recorded_duration >= limit.as_secs_f64()
                    && !self.stop_signalled.swap(true, Ordering::AcqRel)
                {
                    info!(
                        stream = %stream.name,
                        recorded = report.recorded_duration,
                        limit = limit.as_secs_f64(),
                        "Record limit reached, stopping session"
                    );
                    self.token.cancel();
                }
            }
        }
    }
}
