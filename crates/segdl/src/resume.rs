//! Resume scan: classify segments by what is already persisted on disk.

use std::io::ErrorKind;

use tracing::{debug, trace};

use crate::DownloadError;
use crate::model::Stream;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub completed_count: u64,
    pub completed_bytes: u64,
    /// Indices into `Stream::segments`, in stream order.
    pub pending: Vec<usize>,
}

impl ScanResult {
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

pub struct ResumeScanner;

impl ResumeScanner {
    /// A non-empty output file means the segment is done. Zero-byte outputs and
    /// stale `.part` files are leftovers of an interrupted write and are removed.
    pub async fn scan(stream: &Stream) -> Result<ScanResult, DownloadError> {
        let mut result = ScanResult::default();

        for (index, segment) in stream.segments.iter().enumerate() {
            remove_if_present(&segment.part_path()).await?;

            match tokio::fs::metadata(&segment.path).await {
                Ok(meta) if meta.is_file() && meta.len() > 0 => {
                    trace!(segment = %segment.id, size = meta.len(), "Segment already on disk");
                    result.completed_count += 1;
                    result.completed_bytes += meta.len();
                    continue;
                }
                Ok(meta) if meta.is_file() => {
                    debug!(segment = %segment.id, path = %segment.path.display(), "Removing empty segment file");
                    remove_if_present(&segment.path).await?;
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            result.pending.push(index);
        }

        Ok(result)
    }
}

async fn remove_if_present(path: &std::path::Path) -> Result<(), DownloadError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Segment;

    fn stream_in(dir: &std::path::Path, n: u64) -> Stream {
        let segments = (0..n)
            .map(|i| {
                Segment::new(
                    i,
                    format!("http://cdn/{i}.ts"),
                    dir.join(format!("{i:05}.ts")),
                )
            })
            .collect();
        Stream::new("video", segments)
    }

    #[tokio::test]
    async fn complete_files_are_skipped_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let stream = stream_in(dir.path(), 4);
        std::fs::write(&stream.segments[0].path, b"12345").unwrap();
        std::fs::write(&stream.segments[2].path, b"123").unwrap();

        let result = ResumeScanner::scan(&stream).await.unwrap();
        assert_eq!(result.completed_count, 2);
        assert_eq!(result.completed_bytes, 8);
        assert_eq!(result.pending, vec![1, 3]);
    }

    #[tokio::test]
    async fn empty_files_are_deleted_and_pending() {
        let dir = tempfile::tempdir().unwrap();
        let stream = stream_in(dir.path(), 2);
        std::fs::write(&stream.segments[1].path, b"").unwrap();
        std::fs::write(stream.segments[0].part_path(), b"partial").unwrap();

        let result = ResumeScanner::scan(&stream).await.unwrap();
        assert_eq!(result.pending, vec![0, 1]);
        assert_eq!(result.completed_bytes, 0);
        assert!(!stream.segments[1].path.exists());
        assert!(!stream.segments[0].part_path().exists());
    }

    #[tokio::test]
    async fn nothing_pending_when_all_present() {
        let dir = tempfile::tempdir().unwrap();
        let stream = stream_in(dir.path(), 3);
        for seg in &stream.segments {
            std::fs::write(&seg.path, b"x").unwrap();
        }
        let result = ResumeScanner::scan(&stream).await.unwrap();
        assert!(result.is_complete());
        assert_eq!(result.completed_count, 3);
    }
}
