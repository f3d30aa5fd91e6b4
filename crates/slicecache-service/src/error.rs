use std::time::Duration;

use thiserror::Error;

use crate::types::Frame;

/// An error that happens when loading, storing or decoding a frame.
///
/// The error is cheap to clone, so that the outcome of a single load can be handed to every
/// caller that was coalesced onto it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The frame does not exist at the frame source.
    #[error("not found")]
    NotFound,
    /// The frame source refused the request, retrying will not help.
    ///
    /// The attached string contains the frame source's response.
    #[error("rejected: {0}")]
    Rejected(String),
    /// A transient problem like connection loss or a 5xx server response.
    ///
    /// The attached string contains the frame source's response.
    #[error("fetch failed: {0}")]
    FetchFailed(String),
    /// The frame source did not answer in time.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// A transient error persisted through every retry.
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<FrameError> },
    /// A single payload is larger than the whole memory budget.
    #[error("entry of {size} bytes exceeds the memory budget of {budget} bytes")]
    EntryTooLarge { size: u64, budget: u64 },
    /// A compressed payload could not be decoded.
    ///
    /// Callers should treat this like a cache miss and fetch again.
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),
    /// The request was dropped because its study is no longer active.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected error in the engine itself.
    #[error("internal error")]
    InternalError,
}

impl FrameError {
    /// Whether a later attempt at the same fetch might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FrameError::FetchFailed(_) | FrameError::Timeout(_))
    }

    /// A short name for metric tags.
    pub fn as_tag(&self) -> &'static str {
        match self {
            FrameError::NotFound => "notfound",
            FrameError::Rejected(_) => "rejected",
            FrameError::FetchFailed(_) => "fetchfailed",
            FrameError::Timeout(_) => "timeout",
            FrameError::RetriesExhausted { .. } => "retriesexhausted",
            FrameError::EntryTooLarge { .. } => "entrytoolarge",
            FrameError::DecompressionFailed(_) => "decompressionfailed",
            FrameError::Cancelled => "cancelled",
            FrameError::InternalError => "internalerror",
        }
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

impl From<tokio::task::JoinError> for FrameError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> Self {
        Self::from_std_error(err)
    }
}

/// The outcome of a frame request.
pub type FrameResult<T = Frame> = Result<T, FrameError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(FrameError::FetchFailed("502".into()).is_retryable());
        assert!(FrameError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!FrameError::NotFound.is_retryable());
        assert!(!FrameError::Rejected("403".into()).is_retryable());

        let exhausted = FrameError::RetriesExhausted {
            attempts: 3,
            last: Box::new(FrameError::FetchFailed("502".into())),
        };
        assert!(!exhausted.is_retryable());
        assert_eq!(
            exhausted.to_string(),
            "giving up after 3 attempts: fetch failed: 502"
        );
    }
}
