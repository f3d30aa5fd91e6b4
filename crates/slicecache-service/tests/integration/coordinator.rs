use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, join_all};
use slicecache_service::caching::{CacheStore, EntryOptions};
use slicecache_service::error::{FrameError, FrameResult};
use slicecache_service::loader::{BatchLoadCoordinator, Decompressor, ZstdDecompressor};
use slicecache_service::types::{Origin, StudyId};
use slicecache_test::TestFrameSource;
use tokio::runtime::Handle;
use tokio::sync::{Barrier, Semaphore};

use crate::{frame_payload, key, setup, setup_coordinator, wait_until};

/// Decodes zstd, but holds every call until it is released.
struct HeldDecompressor {
    started: AtomicUsize,
    gate: Semaphore,
}

impl Decompressor for HeldDecompressor {
    fn decompress(&self, payload: Bytes) -> BoxFuture<'_, FrameResult<Bytes>> {
        Box::pin(async move {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await.unwrap().forget();
            ZstdDecompressor.decompress(payload).await
        })
    }
}

#[tokio::test]
async fn test_concurrent_requests_are_coalesced() {
    let (coordinator, source) = setup_coordinator(TestFrameSource::new().gated(), |_| {});

    let handles: Vec<_> = (0..10)
        .map(|_| coordinator.request_frame(key(7), Origin::Demand, 0))
        .collect();
    source.release(1);

    for frame in join_all(handles).await {
        assert_eq!(frame.unwrap().payload, frame_payload(7, 1024));
    }
    assert_eq!(source.hits(&key(7)), 1);
    assert_eq!(coordinator.stats().coalesced, 9);

    // now it is cached
    coordinator
        .request_frame(key(7), Origin::Demand, 0)
        .await
        .unwrap();
    assert_eq!(source.accesses(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_requests_share_one_fetch() {
    let source = TestFrameSource::new().with_latency(Duration::from_millis(20));
    let (coordinator, source) = setup_coordinator(source, |_| {});

    let barrier = Arc::new(Barrier::new(32));
    let tasks: Vec<_> = (0..32u32)
        .map(|i| {
            let coordinator = coordinator.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                let origin = if i % 2 == 0 {
                    Origin::Demand
                } else {
                    Origin::Prefetch
                };
                coordinator.request_frame(key(4), origin, i).await
            })
        })
        .collect();

    for result in join_all(tasks).await {
        assert_eq!(result.unwrap().unwrap().payload, frame_payload(4, 1024));
    }
    assert_eq!(source.hits(&key(4)), 1);
    assert_eq!(coordinator.stats().fetches, 1);
}

#[tokio::test]
async fn test_demand_goes_before_prefetch() {
    let (coordinator, source) = setup_coordinator(TestFrameSource::new().gated(), |config| {
        config.loads.max_concurrent_loads = Some(1);
    });

    let mut handles: Vec<_> = (1..=5)
        .map(|slice| coordinator.request_frame(key(slice), Origin::Prefetch, slice - 1))
        .collect();
    handles.push(coordinator.request_frame(key(9), Origin::Demand, 100));

    let stats = coordinator.stats();
    assert_eq!(stats.in_flight, 1);
    assert_eq!(stats.queued, 5);

    source.release(10);
    for frame in join_all(handles).await {
        frame.unwrap();
    }

    let order: Vec<_> = source.calls().iter().map(|key| key.slice).collect();
    // the first prefetch was already running when the demand came in
    assert_eq!(order, vec![1, 9, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_demand_upgrades_queued_prefetch() {
    let (coordinator, source) = setup_coordinator(TestFrameSource::new().gated(), |config| {
        config.loads.max_concurrent_loads = Some(1);
    });

    let handles = vec![
        coordinator.request_frame(key(1), Origin::Prefetch, 0),
        coordinator.request_frame(key(2), Origin::Prefetch, 3),
        coordinator.request_frame(key(3), Origin::Prefetch, 0),
        coordinator.request_frame(key(2), Origin::Demand, 0),
    ];

    source.release(10);
    for frame in join_all(handles).await {
        frame.unwrap();
    }

    let order: Vec<_> = source.calls().iter().map(|key| key.slice).collect();
    assert_eq!(order, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_retry_transient_failures() {
    let (coordinator, source) = setup_coordinator(TestFrameSource::new(), |_| {});
    source.fail_times(&key(3), 2, FrameError::FetchFailed("503".into()));

    let frame = coordinator
        .request_frame(key(3), Origin::Demand, 0)
        .await
        .unwrap();

    assert_eq!(frame.payload, frame_payload(3, 1024));
    assert_eq!(source.hits(&key(3)), 3);
    assert!(coordinator.store().contains(&key(3)));
    assert_eq!(coordinator.stats().retries, 2);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let (coordinator, source) = setup_coordinator(TestFrameSource::new(), |_| {});
    source.always_fail(FrameError::FetchFailed("503".into()));

    let err = coordinator
        .request_frame(key(3), Origin::Demand, 0)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        FrameError::RetriesExhausted {
            attempts: 3,
            last: Box::new(FrameError::FetchFailed("503".into())),
        }
    );
    assert_eq!(source.hits(&key(3)), 3);
    assert!(!coordinator.store().contains(&key(3)));

    let stats = coordinator.stats();
    assert_eq!(stats.failed_demands, 1);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_terminal_errors_are_not_retried() {
    let (coordinator, source) = setup_coordinator(TestFrameSource::new(), |_| {});
    source.fail_times(&key(1), 1, FrameError::NotFound);

    let err = coordinator
        .request_frame(key(1), Origin::Demand, 0)
        .await
        .unwrap_err();
    assert_eq!(err, FrameError::NotFound);
    assert_eq!(source.hits(&key(1)), 1);

    // a later request tries again
    coordinator
        .request_frame(key(1), Origin::Demand, 0)
        .await
        .unwrap();
    assert_eq!(source.hits(&key(1)), 2);
}

#[tokio::test]
async fn test_timeouts_are_retried() {
    let source = TestFrameSource::new().with_latency(Duration::from_millis(500));
    let (coordinator, source) = setup_coordinator(source, |config| {
        config.loads.timeout = Duration::from_millis(20);
        config.loads.retry.attempts = 2;
    });

    let err = coordinator
        .request_frame(key(1), Origin::Demand, 0)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        FrameError::RetriesExhausted {
            attempts: 2,
            last: Box::new(FrameError::Timeout(Duration::from_millis(20))),
        }
    );
    assert_eq!(source.hits(&key(1)), 2);
}

#[tokio::test]
async fn test_prefetch_failures_are_swallowed() {
    let (coordinator, source) = setup_coordinator(TestFrameSource::new(), |_| {});
    source.always_fail(FrameError::Rejected("403".into()));

    assert!(coordinator.prefetch(key(4), 0));
    wait_until(|| coordinator.stats().failed_prefetches == 1).await;

    let stats = coordinator.stats();
    assert_eq!(stats.failed_demands, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(source.hits(&key(4)), 1);
}

#[tokio::test]
async fn test_prefetch_skips_cached_frames() {
    let (coordinator, source) = setup_coordinator(TestFrameSource::new(), |_| {});

    coordinator
        .request_frame(key(1), Origin::Demand, 0)
        .await
        .unwrap();
    assert!(!coordinator.prefetch(key(1), 0));
    assert_eq!(source.accesses(), 1);
}

#[tokio::test]
async fn test_switching_study_cancels_pending_loads() {
    let (coordinator, source) = setup_coordinator(TestFrameSource::new().gated(), |config| {
        config.loads.max_concurrent_loads = Some(1);
    });
    let study = StudyId::new("study");
    coordinator.set_active_study(&study);

    let running = coordinator.request_frame(key(1), Origin::Demand, 0);
    let queued = coordinator.request_frame(key(2), Origin::Prefetch, 0);

    let cancelled = coordinator.set_active_study(&StudyId::new("other"));
    assert_eq!(cancelled, 1);
    assert_eq!(queued.await.unwrap_err(), FrameError::Cancelled);

    // the running load is not interrupted, its result is still cached
    source.release(1);
    running.await.unwrap();
    assert!(coordinator.store().contains(&key(1)));
    assert!(!coordinator.store().contains(&key(2)));
    assert_eq!(source.hits(&key(2)), 0);

    let stats = coordinator.stats();
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.failed_prefetches, 0);
}

#[tokio::test]
async fn test_cancelled_running_load_is_not_retried() {
    let (coordinator, source) = setup_coordinator(TestFrameSource::new().gated(), |_| {});
    source.always_fail(FrameError::FetchFailed("503".into()));

    let running = coordinator.request_frame(key(1), Origin::Demand, 0);
    coordinator.cancel_study(&StudyId::new("study"));
    source.release(1);

    assert_eq!(running.await.unwrap_err(), FrameError::Cancelled);
    assert_eq!(source.hits(&key(1)), 1);
}

#[tokio::test]
async fn test_compressed_frames() {
    let (coordinator, source) = setup_coordinator(TestFrameSource::new().compressed(), |_| {});

    let frame = coordinator
        .request_frame(key(5), Origin::Demand, 0)
        .await
        .unwrap();
    assert_eq!(frame.payload, frame_payload(5, 1024));

    let entry = coordinator.store().peek(&key(5)).unwrap();
    assert!(entry.is_compressed());
    assert!(entry.size_bytes() < 1024);

    // served from the cache, decompressed again
    let frame = coordinator
        .request_frame(key(5), Origin::Demand, 0)
        .await
        .unwrap();
    assert_eq!(frame.payload, frame_payload(5, 1024));
    assert_eq!(source.accesses(), 1);
}

#[tokio::test]
async fn test_corrupt_fetch_is_not_cached() {
    let (coordinator, source) = setup_coordinator(TestFrameSource::new().compressed(), |_| {});
    source.corrupt(&key(5));

    let err = coordinator
        .request_frame(key(5), Origin::Demand, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, FrameError::DecompressionFailed(_)));
    assert!(!coordinator.store().contains(&key(5)));

    source.repair(&key(5));
    let frame = coordinator
        .request_frame(key(5), Origin::Demand, 0)
        .await
        .unwrap();
    assert_eq!(frame.payload, frame_payload(5, 1024));
}

#[tokio::test]
async fn test_frame_is_cached_after_decompression() {
    setup();
    let config = slicecache_test::config();
    let decompressor = Arc::new(HeldDecompressor {
        started: AtomicUsize::new(0),
        gate: Semaphore::new(0),
    });
    let (source, shared) = slicecache_test::shared(TestFrameSource::new().compressed());
    let coordinator = BatchLoadCoordinator::new(
        &config.loads,
        shared,
        decompressor.clone(),
        Arc::new(CacheStore::from_config(&config.cache)),
        Handle::current(),
    );

    let handle = coordinator.request_frame(key(3), Origin::Demand, 0);
    wait_until(|| decompressor.started.load(Ordering::SeqCst) == 1).await;

    // the payload is not visible while it is still being decoded
    assert!(!coordinator.store().contains(&key(3)));
    assert!(coordinator.prefetch(key(3), 0));
    assert_eq!(coordinator.stats().coalesced, 1);

    decompressor.gate.add_permits(1);
    let frame = handle.await.unwrap();
    assert_eq!(frame.payload, frame_payload(3, 1024));

    let entry = coordinator.store().peek(&key(3)).unwrap();
    assert!(entry.is_compressed());
    assert_eq!(source.hits(&key(3)), 1);
    assert_eq!(decompressor.started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_corrupt_cache_entry_is_refetched() {
    let (coordinator, source) = setup_coordinator(TestFrameSource::new(), |_| {});
    let options = EntryOptions {
        compressed: true,
        ..Default::default()
    };
    coordinator
        .store()
        .put(key(6), Bytes::from_static(b"garbage"), options)
        .unwrap();

    let frame = coordinator
        .request_frame(key(6), Origin::Demand, 0)
        .await
        .unwrap();
    assert_eq!(frame.payload, frame_payload(6, 1024));
    assert_eq!(source.hits(&key(6)), 1);

    let entry = coordinator.store().peek(&key(6)).unwrap();
    assert!(!entry.is_compressed());
}

#[tokio::test]
async fn test_entry_too_large() {
    let (coordinator, _source) = setup_coordinator(TestFrameSource::new(), |config| {
        config.cache.max_memory_bytes = 100;
    });

    let err = coordinator
        .request_frame(key(1), Origin::Demand, 0)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        FrameError::EntryTooLarge {
            size: 1024,
            budget: 100,
        }
    );
}

#[tokio::test]
async fn test_raising_concurrency_dispatches_queued_loads() {
    let (coordinator, source) = setup_coordinator(TestFrameSource::new().gated(), |config| {
        config.loads.max_concurrent_loads = Some(1);
    });

    let handles: Vec<_> = (0..4)
        .map(|slice| coordinator.request_frame(key(slice), Origin::Prefetch, slice))
        .collect();
    assert_eq!(coordinator.stats().in_flight, 1);

    coordinator.set_max_concurrent_loads(3);
    assert_eq!(coordinator.stats().in_flight, 3);

    source.release(4);
    for frame in join_all(handles).await {
        frame.unwrap();
    }
    assert_eq!(coordinator.stats().in_flight, 0);
}
