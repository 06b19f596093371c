//! Streams and segments as handed over by manifest parsing.

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Retry budget for HTTP 404 responses when the manifest does not set one.
pub const DEFAULT_MAX_RETRY_404: u32 = 1;

/// Stable identity of a segment within its stream (the media sequence number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub u64);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a stream's segments were modelled by the manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamModel {
    #[default]
    Generic,
    /// Smooth Streaming: the init header is rebuilt from downloaded fragments.
    Mss,
}

impl StreamModel {
    /// Whether the header must be assembled from segment data once downloading is over.
    pub fn requires_header_fixup(self) -> bool {
        match self {
            StreamModel::Generic => false,
            StreamModel::Mss => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMethod {
    /// HLS `METHOD=AES-128`.
    #[serde(rename = "aes-128", alias = "AES-128")]
    Aes128,
    #[serde(alias = "SAMPLE-AES")]
    SampleAes,
    Cenc,
    #[serde(other)]
    Unknown,
}

/// Key material resolved by the DRM collaborator.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    pub method: EncryptionMethod,
    #[serde(with = "hex_bytes")]
    pub key: Vec<u8>,
    /// Explicit IV; derived from the segment id when absent.
    #[serde(default, with = "hex_iv")]
    pub iv: Option<[u8; 16]>,
}

impl fmt::Debug for EncryptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionInfo")
            .field("method", &self.method)
            .field("key", &"<redacted>")
            .field("iv", &self.iv.map(hex::encode))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub url: String,
    /// Output file; its non-empty presence is the resume checkpoint.
    pub path: PathBuf,
    /// Media duration in seconds, used for live record limits.
    #[serde(default)]
    pub duration: f64,
    /// Remaining HTTP 404 responses tolerated before the segment is dropped.
    #[serde(default = "default_max_retry_404")]
    pub max_retry_404: u32,
    /// Present but unusable for final assembly (403/404).
    #[serde(default)]
    pub skip_concat: bool,
    #[serde(default)]
    pub encryption: Option<EncryptionInfo>,
    #[serde(skip)]
    buffer: Vec<Bytes>,
}

fn default_max_retry_404() -> u32 {
    DEFAULT_MAX_RETRY_404
}

impl Segment {
    pub fn new(id: u64, url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: SegmentId(id),
            url: url.into(),
            path: path.into(),
            duration: 0.0,
            max_retry_404: DEFAULT_MAX_RETRY_404,
            skip_concat: false,
            encryption: None,
            buffer: Vec::new(),
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = seconds;
        self
    }

    pub fn with_max_retry_404(mut self, budget: u32) -> Self {
        self.max_retry_404 = budget;
        self
    }

    pub fn with_encryption(mut self, info: EncryptionInfo) -> Self {
        self.encryption = Some(info);
        self
    }

    /// A segment whose 404 budget is spent is never requested again.
    pub fn is_exhausted(&self) -> bool {
        self.max_retry_404 == 0
    }

    pub(crate) fn push_chunk(&mut self, chunk: Bytes) {
        self.buffer.push(chunk);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.iter().map(Bytes::len).sum()
    }

    pub(crate) fn take_buffer(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.buffered_len());
        for chunk in self.buffer.drain(..) {
            out.extend_from_slice(&chunk);
        }
        out
    }

    pub(crate) fn clear_buffer(&mut self) {
        self.buffer.clear();
    }

    /// Temporary path written before the atomic rename into [`Segment::path`].
    pub fn part_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".part");
        PathBuf::from(name)
    }
}

/// One selectable track: an ordered list of segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub name: String,
    #[serde(default)]
    pub model: StreamModel,
    /// Bytes observed so far, refined as headers and bodies arrive.
    #[serde(default)]
    pub filesize: u64,
    pub segments: Vec<Segment>,
}

impl Stream {
    pub fn new(name: impl Into<String>, segments: Vec<Segment>) -> Self {
        Self {
            name: name.into(),
            model: StreamModel::Generic,
            filesize: 0,
            segments,
        }
    }

    pub fn with_model(mut self, model: StreamModel) -> Self {
        self.model = model;
        self
    }

    /// First segment id that appears more than once, if any.
    pub fn duplicate_id(&self) -> Option<SegmentId> {
        let mut seen = std::collections::HashSet::with_capacity(self.segments.len());
        self.segments
            .iter()
            .map(|s| s.id)
            .find(|id| !seen.insert(*id))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        hex::decode(raw.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

mod hex_iv {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(iv: &Option<[u8; 16]>, s: S) -> Result<S::Ok, S::Error> {
        match iv {
            Some(iv) => s.serialize_some(&hex::encode(iv)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 16]>, D::Error> {
        let Some(raw) = Option::<String>::deserialize(d)? else {
            return Ok(None);
        };
        crate::decryption::parse_iv(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}
