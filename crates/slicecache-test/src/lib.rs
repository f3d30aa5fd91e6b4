//! Helpers for testing the engine.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Use [`config`] instead of the default configuration. It uses short retry delays and
//!    disables background pressure sampling, so that tests are fast and deterministic.
//!
//!  - A [`TestFrameSource`] serves synthetic frames and records every fetch. Failures, latency
//!    and compression can be scripted per frame. A gated source only answers as many fetches as
//!    were [released](TestFrameSource::release), which allows inspecting the dispatch order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use slicecache_service::config::Config;
use slicecache_service::error::{FrameError, FrameResult};
use slicecache_service::loader::FrameSource;
use slicecache_service::types::{FetchedFrame, FrameKey, QualityLevel, StudyId};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `slicecache_service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("slicecache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A configuration suitable for tests.
///
/// Retries are almost immediate, there is no background sampling and two loads run at a time.
pub fn config() -> Config {
    let mut config = Config::default();
    config.loads.max_concurrent_loads = Some(2);
    config.loads.timeout = Duration::from_secs(5);
    config.loads.retry.base_delay = Duration::from_millis(1);
    config.loads.retry.max_delay = Duration::from_millis(10);
    config.loads.retry.jitter = Duration::from_millis(1);
    config.pressure.sample_interval = None;
    config
}

/// The raw payload the [`TestFrameSource`] serves for `slice`.
pub fn frame_payload(slice: u32, size: usize) -> Bytes {
    Bytes::from(vec![(slice % 251) as u8; size])
}

#[derive(Debug, Default)]
struct Script {
    /// Remaining scripted failures per frame.
    failures: BTreeMap<String, (usize, FrameError)>,
    /// Fails every fetch that has no scripted failure.
    always_fail: Option<FrameError>,
    /// Frames that are served as undecodable compressed payloads.
    corrupt: BTreeSet<String>,
}

/// A programmable in-memory [`FrameSource`].
#[derive(Debug)]
pub struct TestFrameSource {
    frame_size: usize,
    latency: Duration,
    compressed: bool,
    gate: Option<Semaphore>,
    calls: Mutex<Vec<FrameKey>>,
    script: Mutex<Script>,
}

impl TestFrameSource {
    pub fn new() -> Self {
        Self {
            frame_size: 1024,
            latency: Duration::ZERO,
            compressed: false,
            gate: None,
            calls: Mutex::default(),
            script: Mutex::default(),
        }
    }

    /// Serves raw payloads of `size` bytes.
    pub fn with_frame_size(mut self, size: usize) -> Self {
        self.frame_size = size;
        self
    }

    /// Delays every answer.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Serves zstd compressed payloads.
    pub fn compressed(mut self) -> Self {
        self.compressed = true;
        self
    }

    /// Holds every fetch until it is [released](Self::release).
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Lets `count` held fetches proceed.
    pub fn release(&self, count: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(count);
        }
    }

    /// Fails the next `times` fetches of `key` with `error`.
    pub fn fail_times(&self, key: &FrameKey, times: usize, error: FrameError) {
        let mut script = self.script.lock().unwrap();
        script.failures.insert(key.to_string(), (times, error));
    }

    /// Fails all fetches with `error`.
    pub fn always_fail(&self, error: FrameError) {
        self.script.lock().unwrap().always_fail = Some(error);
    }

    /// Serves `key` as a compressed payload that cannot be decompressed.
    pub fn corrupt(&self, key: &FrameKey) {
        self.script.lock().unwrap().corrupt.insert(key.to_string());
    }

    /// Serves `key` correctly again.
    pub fn repair(&self, key: &FrameKey) {
        self.script.lock().unwrap().corrupt.remove(&key.to_string());
    }

    /// All fetches in the order they were started.
    pub fn calls(&self) -> Vec<FrameKey> {
        self.calls.lock().unwrap().clone()
    }

    /// The number of fetches of `key`.
    pub fn hits(&self, key: &FrameKey) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| *call == key)
            .count()
    }

    /// The total number of fetches.
    pub fn accesses(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn answer(&self, key: &FrameKey) -> FrameResult<FetchedFrame> {
        let mut script = self.script.lock().unwrap();
        let name = key.to_string();

        if let Some((remaining, error)) = script.failures.get_mut(&name)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(error.clone());
        }
        if let Some(error) = &script.always_fail {
            return Err(error.clone());
        }
        if script.corrupt.contains(&name) {
            return Ok(FetchedFrame::compressed(Bytes::from_static(b"not a zstd frame")));
        }
        drop(script);

        let payload = frame_payload(key.slice, self.frame_size);
        if self.compressed {
            let compressed = zstd::encode_all(payload.as_ref(), 3)
                .map_err(|err| FrameError::FetchFailed(err.to_string()))?;
            Ok(FetchedFrame::compressed(compressed))
        } else {
            Ok(FetchedFrame::raw(payload))
        }
    }
}

impl Default for TestFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for TestFrameSource {
    fn fetch<'a>(
        &'a self,
        study: &'a StudyId,
        slice: u32,
        quality: QualityLevel,
    ) -> BoxFuture<'a, FrameResult<FetchedFrame>> {
        Box::pin(async move {
            let key = FrameKey::new(study.clone(), slice, quality);
            self.calls.lock().unwrap().push(key.clone());

            if let Some(gate) = &self.gate {
                match gate.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => return Err(FrameError::Cancelled),
                }
            }
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            self.answer(&key)
        })
    }
}

/// Shares a [`TestFrameSource`] with an engine while keeping access to it.
pub fn shared(source: TestFrameSource) -> (Arc<TestFrameSource>, Arc<dyn FrameSource>) {
    let source = Arc::new(source);
    (source.clone(), source)
}
