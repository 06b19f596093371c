use async_trait::async_trait;

use crate::DownloadError;
use crate::model::Stream;

/// Hooks run once a stream's round loop is over.
///
/// Concatenation and muxing live outside the engine; implementors receive the
/// stream with `skip_concat` flags settled and every completed segment on disk.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    /// Rebuild the stream header from downloaded segment data.
    async fn fix_header(&self, stream: &Stream) -> Result<(), DownloadError>;

    /// Join the segments of a finished stream.
    async fn concat(&self, stream: &Stream) -> Result<(), DownloadError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPostProcessor;

#[async_trait]
impl PostProcessor for NoopPostProcessor {
    async fn fix_header(&self, _stream: &Stream) -> Result<(), DownloadError> {
        Ok(())
    }

    async fn concat(&self, _stream: &Stream) -> Result<(), DownloadError> {
        Ok(())
    }
}
