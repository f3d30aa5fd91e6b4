use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use slicecache_service::error::{FrameError, FrameResult};
use slicecache_service::loader::FrameSource;
use slicecache_service::types::{FetchedFrame, QualityLevel, StudyId};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

/// How the simulated user moves through a study.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrubPattern {
    /// Steps towards the end, starting over at the first slice.
    #[default]
    Forward,
    /// Steps towards the start, starting over at the last slice.
    Backward,
    /// Bounces between the first and the last slice.
    Oscillate,
    /// Jumps to random slices.
    Random,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Workload {
    /// Name of the simulated study.
    pub study: String,
    /// Number of slices in the study.
    pub slices: u32,
    pub pattern: ScrubPattern,
    /// Navigation events per second.
    pub rate: f64,
    /// Simulated latency of the frame source.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Fraction of fetches that fail transiently.
    pub failure_rate: f64,
    /// Size of a decompressed frame in bytes.
    pub frame_size: usize,
    /// Whether the frame source serves zstd compressed frames.
    pub compressed: bool,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            study: "study".into(),
            slices: 200,
            pattern: ScrubPattern::default(),
            rate: 20.0,
            latency: Duration::from_millis(20),
            failure_rate: 0.0,
            frame_size: 256 * 1024,
            compressed: false,
        }
    }
}

/// Produces the slices a simulated user navigates to.
#[derive(Debug)]
pub struct Scrubber {
    pattern: ScrubPattern,
    slices: u32,
    current: u32,
    forward: bool,
}

impl Scrubber {
    pub fn new(pattern: ScrubPattern, slices: u32) -> Self {
        let slices = slices.max(1);
        let current = match pattern {
            ScrubPattern::Backward => slices - 1,
            _ => 0,
        };
        Self {
            pattern,
            slices,
            current,
            forward: true,
        }
    }

    pub fn next_slice(&mut self) -> u32 {
        let slice = self.current;
        let last = self.slices - 1;
        self.current = match self.pattern {
            ScrubPattern::Forward => (slice + 1) % self.slices,
            ScrubPattern::Backward => slice.checked_sub(1).unwrap_or(last),
            ScrubPattern::Oscillate => {
                if self.forward && slice == last {
                    self.forward = false;
                } else if !self.forward && slice == 0 {
                    self.forward = true;
                }
                if self.forward {
                    (slice + 1).min(last)
                } else {
                    slice.saturating_sub(1)
                }
            }
            ScrubPattern::Random => rand::random_range(0..self.slices),
        };
        slice
    }
}

/// A frame source that serves the same synthetic payload for every frame.
#[derive(Debug)]
pub struct SyntheticFrameSource {
    payload: Bytes,
    compressed: bool,
    latency: Duration,
    failure_rate: f64,
}

impl SyntheticFrameSource {
    pub fn new(workload: &Workload) -> anyhow::Result<Self> {
        // a gradient compresses about as well as a typical image
        let raw: Vec<u8> = (0..workload.frame_size).map(|i| (i / 64) as u8).collect();
        let payload = if workload.compressed {
            Bytes::from(zstd::encode_all(&raw[..], 3)?)
        } else {
            Bytes::from(raw)
        };

        Ok(Self {
            payload,
            compressed: workload.compressed,
            latency: workload.latency,
            failure_rate: workload.failure_rate,
        })
    }
}

impl FrameSource for SyntheticFrameSource {
    fn fetch<'a>(
        &'a self,
        _study: &'a StudyId,
        _slice: u32,
        _quality: QualityLevel,
    ) -> BoxFuture<'a, FrameResult<FetchedFrame>> {
        Box::pin(async move {
            tokio::time::sleep(self.latency).await;
            if rand::random::<f64>() < self.failure_rate {
                return Err(FrameError::FetchFailed("synthetic failure".into()));
            }
            Ok(FetchedFrame {
                payload: self.payload.clone(),
                compressed: self.compressed,
            })
        })
    }
}
