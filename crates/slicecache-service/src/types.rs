use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifies a study (a multi-slice image series).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudyId(Arc<str>);

impl StudyId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StudyId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for StudyId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

/// A discrete level of detail.
///
/// Level `0` is full fidelity, every higher level is coarser and therefore smaller.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct QualityLevel(u8);

impl QualityLevel {
    pub const FULL: Self = Self(0);

    pub const fn new(level: u8) -> Self {
        Self(level)
    }

    pub const fn level(self) -> u8 {
        self.0
    }

    /// The next coarser level, saturating at `coarsest`.
    pub fn coarser(self, coarsest: QualityLevel) -> Self {
        Self(self.0.saturating_add(1).min(coarsest.0.max(self.0)))
    }

    /// The next finer level, saturating at [`QualityLevel::FULL`].
    pub fn finer(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// The key of a frame, unique per study, slice and quality level.
///
/// The key doubles as the immutable metadata of a cached frame.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub study: StudyId,
    pub slice: u32,
    pub quality: QualityLevel,
}

impl FrameKey {
    pub fn new(study: impl Into<StudyId>, slice: u32, quality: QualityLevel) -> Self {
        Self {
            study: study.into(),
            slice,
            quality,
        }
    }
}

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.study, self.slice, self.quality)
    }
}

/// Why a frame was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// The user is looking at this frame right now.
    Demand,
    /// The frame is predicted to be needed soon.
    Prefetch,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Demand => "demand",
            Origin::Prefetch => "prefetch",
        }
    }
}

/// A frame as it is handed out to the renderer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub key: FrameKey,
    /// The decompressed frame payload.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(key: FrameKey, payload: Bytes) -> Self {
        Self { key, payload }
    }
}

/// A frame payload as returned by a [`FrameSource`](crate::loader::FrameSource).
#[derive(Clone, Debug)]
pub struct FetchedFrame {
    pub payload: Bytes,
    /// Whether `payload` still needs to go through the decompressor before use.
    pub compressed: bool,
}

impl FetchedFrame {
    pub fn raw(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            compressed: false,
        }
    }

    pub fn compressed(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            compressed: true,
        }
    }
}
