//! What a download pass hands back to the caller.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::fetcher::FetchTag;
use crate::model::SegmentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    /// Output file present and non-empty.
    Completed,
    /// Answered 403/404; present-but-unusable for assembly.
    Skipped,
    /// Its own fetch aborted the stream.
    Failed,
    /// Still missing; another pass may fetch it.
    Pending,
}

impl SegmentStatus {
    /// `Some(true)` done, `Some(false)` unrecoverable, `None` needs retry.
    pub fn as_flag(self) -> Option<bool> {
        match self {
            SegmentStatus::Completed | SegmentStatus::Skipped => Some(true),
            SegmentStatus::Failed => Some(false),
            SegmentStatus::Pending => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamVerdict {
    Complete,
    /// Round budget spent with segments still pending.
    Incomplete,
    Aborted(FetchTag),
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamReport {
    pub stream: String,
    /// Rounds that actually issued requests.
    pub rounds: u32,
    pub verdict: StreamVerdict,
    pub outcomes: BTreeMap<SegmentId, SegmentStatus>,
    /// Bytes of completed segment files, including those found on resume.
    pub downloaded_bytes: u64,
    /// Segments the last round still expected, after 403/404 exclusions.
    pub target_count: u64,
    /// Completed bytes as the progress meter last saw them.
    pub progress_bytes: u64,
    /// Seconds of media in completed segments.
    pub recorded_duration: f64,
}

impl StreamReport {
    pub fn is_complete(&self) -> bool {
        self.verdict == StreamVerdict::Complete
    }

    pub fn count(&self, status: SegmentStatus) -> usize {
        self.outcomes.values().filter(|s| **s == status).count()
    }

    pub fn flags(&self) -> BTreeMap<SegmentId, Option<bool>> {
        self.outcomes
            .iter()
            .map(|(id, status)| (*id, status.as_flag()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    pub streams: Vec<StreamReport>,
    /// A live stream reached its record limit during this session.
    pub stop_recording: bool,
    /// The session token was cancelled from outside.
    pub interrupted: bool,
}

impl SessionReport {
    pub fn all_complete(&self) -> bool {
        self.streams.iter().all(StreamReport::is_complete)
    }
}
