use std::sync::Arc;
use std::time::Duration;

use slicecache_service::caching::CacheStore;
use slicecache_service::config::Config;
use slicecache_service::engine::FrameEngine;
use slicecache_service::loader::{BatchLoadCoordinator, ZstdDecompressor};
use slicecache_service::types::{FrameKey, QualityLevel};
use slicecache_test::TestFrameSource;
use tokio::runtime::Handle;

pub use slicecache_test::{frame_payload, setup};

pub fn key(slice: u32) -> FrameKey {
    FrameKey::new("study", slice, QualityLevel::FULL)
}

/// Creates a coordinator on top of `source` with the test configuration.
///
/// The closure can be used to modify the configuration before the coordinator is created.
pub fn setup_coordinator<F>(
    source: TestFrameSource,
    update_config: F,
) -> (Arc<BatchLoadCoordinator>, Arc<TestFrameSource>)
where
    F: FnOnce(&mut Config),
{
    setup();
    let mut config = slicecache_test::config();
    update_config(&mut config);

    let (source, shared) = slicecache_test::shared(source);
    let store = Arc::new(CacheStore::from_config(&config.cache));
    let coordinator = BatchLoadCoordinator::new(
        &config.loads,
        shared,
        Arc::new(ZstdDecompressor),
        store,
        Handle::current(),
    );
    (coordinator, source)
}

/// Creates an engine on top of `source` with the test configuration.
pub fn setup_engine<F>(
    source: TestFrameSource,
    update_config: F,
) -> (Arc<FrameEngine>, Arc<TestFrameSource>)
where
    F: FnOnce(&mut Config),
{
    setup();
    let mut config = slicecache_test::config();
    update_config(&mut config);

    let (source, shared) = slicecache_test::shared(source);
    let engine = FrameEngine::new(&config, shared, Handle::current());
    (engine, source)
}

/// Waits until `condition` holds, failing the test after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("condition was not met in time");
}
