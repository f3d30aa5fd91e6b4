use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::{FrameError, FrameResult};
use crate::types::{FetchedFrame, QualityLevel, StudyId};

/// The remote origin of frame payloads.
///
/// Fetches are assumed to be idempotent. The coordinator never issues two concurrent fetches for
/// the same frame, but a frame may be fetched again after it has been evicted.
///
/// Implementations should return [`FrameError::FetchFailed`] for transient problems so that the
/// fetch is retried, and [`FrameError::NotFound`] or [`FrameError::Rejected`] for anything that
/// will not get better by trying again.
pub trait FrameSource: Send + Sync + 'static {
    fn fetch<'a>(
        &'a self,
        study: &'a StudyId,
        slice: u32,
        quality: QualityLevel,
    ) -> BoxFuture<'a, FrameResult<FetchedFrame>>;
}

/// Turns compressed payloads into usable frames.
pub trait Decompressor: Send + Sync + 'static {
    fn decompress(&self, payload: Bytes) -> BoxFuture<'_, FrameResult<Bytes>>;
}

/// Decodes zstd frames on the blocking thread pool.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZstdDecompressor;

impl Decompressor for ZstdDecompressor {
    fn decompress(&self, payload: Bytes) -> BoxFuture<'_, FrameResult<Bytes>> {
        Box::pin(async move {
            let compressed_size = payload.len();
            let decoded = tokio::task::spawn_blocking(move || zstd::decode_all(payload.as_ref()))
                .await?
                .map_err(|err| FrameError::DecompressionFailed(err.to_string()))?;

            metric!(time_raw("loader.decompressed_size") = decoded.len() as u64);
            tracing::trace!(
                compressed_size,
                decompressed_size = decoded.len(),
                "Decompressed frame"
            );
            Ok(Bytes::from(decoded))
        })
    }
}
