use std::time::{Duration, Instant};

use slicecache_service::engine::Statistics;
use slicecache_service::navigation::Direction;
use slicecache_service::pressure::PressureLevel;
use slicecache_service::types::{QualityLevel, StudyId};
use slicecache_test::TestFrameSource;

use crate::{frame_payload, setup_engine, wait_until};

fn scrub(engine: &slicecache_service::engine::FrameEngine, study: &StudyId, slices: &[u32]) {
    let start = Instant::now();
    for (i, slice) in slices.iter().enumerate() {
        engine.observe_at(study, *slice, start + Duration::from_secs(i as u64));
    }
}

#[tokio::test]
async fn test_prefetch_window_follows_velocity() {
    let (engine, source) = setup_engine(TestFrameSource::new(), |_| {});
    let study = StudyId::new("study");
    engine.open_study(&study, 200);

    // 3 slices per second towards slice 50
    scrub(&engine, &study, &[41, 44, 47, 50]);

    let predicted = engine.predict(&study, 50, 5);
    assert_eq!(predicted, (51..=60).collect::<Vec<_>>());

    assert_eq!(engine.prefetch(&study, 50), 10);
    wait_until(|| engine.statistics().entries == 10).await;
    assert_eq!(source.accesses(), 10);

    // prefetching again finds everything cached
    assert_eq!(engine.prefetch(&study, 50), 0);

    let frame = engine.request_slice(&study, 51).await.unwrap();
    assert_eq!(frame.payload, frame_payload(51, 1024));
    assert_eq!(source.accesses(), 10);

    let stats = engine.statistics();
    assert_eq!(stats.hit_rate, 1.0);
    assert!((stats.prefetch_hit_rate - 0.1).abs() < 1e-9);
}

#[tokio::test]
async fn test_predictions_stay_within_study() {
    let (engine, _source) = setup_engine(TestFrameSource::new(), |_| {});
    let study = StudyId::new("study");
    engine.open_study(&study, 200);
    scrub(&engine, &study, &[190, 193, 196, 199]);

    assert!(engine.predict(&study, 199, 5).is_empty());
    assert!(engine.predict(&StudyId::new("unknown"), 10, 5).is_empty());
}

#[tokio::test]
async fn test_navigate_demands_before_prefetching() {
    let (engine, source) = setup_engine(TestFrameSource::new().gated(), |config| {
        config.loads.max_concurrent_loads = Some(1);
    });
    let study = StudyId::new("study");
    engine.open_study(&study, 100);

    let handle = engine.navigate(&study, 10);
    source.release(100);
    let frame = handle.await.unwrap();
    assert_eq!(frame.payload, frame_payload(10, 1024));

    let pattern = engine.observe(&study, 10);
    assert_eq!(pattern.direction(), Direction::Bidirectional);

    wait_until(|| source.accesses() == 7).await;
    let order: Vec<_> = source.calls().iter().map(|key| key.slice).collect();
    // without a pattern, the nearest slices on both sides are prefetched
    assert_eq!(order, vec![10, 11, 9, 12, 8, 13, 7]);
}

#[tokio::test]
async fn test_concurrency_adapts_to_study_size() {
    let (engine, _source) = setup_engine(TestFrameSource::new(), |config| {
        config.loads.max_concurrent_loads = None;
    });

    engine.open_study(&StudyId::new("small"), 20);
    assert_eq!(engine.statistics().max_concurrent_loads, 1);

    engine.open_study(&StudyId::new("large"), 400);
    assert_eq!(engine.statistics().max_concurrent_loads, 4);

    let (engine, _source) = setup_engine(TestFrameSource::new(), |config| {
        config.loads.max_concurrent_loads = Some(3);
    });
    engine.open_study(&StudyId::new("small"), 20);
    assert_eq!(engine.statistics().max_concurrent_loads, 3);
}

#[tokio::test]
async fn test_hit_rate() {
    let (engine, source) = setup_engine(TestFrameSource::new(), |_| {});
    let study = StudyId::new("study");
    engine.open_study(&study, 10);

    engine.request_slice(&study, 1).await.unwrap();
    engine.request_slice(&study, 1).await.unwrap();

    let stats = engine.statistics();
    assert_eq!(stats.hit_rate, 0.5);
    assert_eq!(stats.memory_usage, 1024);
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.fetches, 1);
    assert_eq!(source.accesses(), 1);
}

#[tokio::test]
async fn test_critical_pressure_evicts_and_degrades_quality() {
    let (engine, source) = setup_engine(TestFrameSource::new().with_frame_size(1000), |config| {
        config.cache.max_memory_bytes = 10_000;
    });
    let study = StudyId::new("study");
    engine.open_study(&study, 100);

    for slice in 0..10 {
        engine.request_slice(&study, slice).await.unwrap();
    }
    assert_eq!(engine.statistics().memory_usage, 10_000);

    assert_eq!(engine.sample(), PressureLevel::Critical);
    let stats = engine.statistics();
    assert!(stats.memory_usage <= 7_000);
    assert!(stats.eviction_count >= 3);
    assert_eq!(stats.pressure, PressureLevel::Critical);
    assert_eq!(stats.quality_level, QualityLevel::new(1));

    // new requests use the coarser level
    engine.request_slice(&study, 50).await.unwrap();
    assert_eq!(source.calls().last().map(|key| key.quality), Some(QualityLevel::new(1)));

    // quality does not recover on its own
    assert_eq!(engine.sample(), PressureLevel::High);
    assert_eq!(engine.target_quality(), QualityLevel::new(1));
    assert_eq!(engine.request_quality_upgrade(), QualityLevel::FULL);
}

#[tokio::test]
async fn test_slow_rendering_raises_pressure() {
    let (engine, _source) = setup_engine(TestFrameSource::new(), |_| {});
    assert_eq!(engine.sample(), PressureLevel::Low);

    for _ in 0..10 {
        engine.record_render_time(Duration::from_millis(100));
    }
    assert_eq!(engine.sample(), PressureLevel::Medium);
}

#[tokio::test]
async fn test_background_sampling() {
    let (engine, _source) = setup_engine(TestFrameSource::new().with_frame_size(1000), |config| {
        config.cache.max_memory_bytes = 1_000;
        config.pressure.sample_interval = Some(Duration::from_millis(5));
    });
    let study = StudyId::new("study");
    engine.open_study(&study, 10);
    engine.request_slice(&study, 0).await.unwrap();

    wait_until(|| engine.target_quality() != QualityLevel::FULL).await;
    assert_eq!(engine.statistics().memory_usage, 0);
}

#[tokio::test]
async fn test_close_study_releases_frames() {
    let (engine, _source) = setup_engine(TestFrameSource::new(), |_| {});
    let study = StudyId::new("study");
    engine.open_study(&study, 10);
    scrub(&engine, &study, &[1, 2, 3]);
    engine.request_slice(&study, 3).await.unwrap();

    engine.close_study(&study);

    let stats: Statistics = engine.statistics();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.memory_usage, 0);
    assert!(engine.total_slices(&study).is_none());
    assert!(engine.predict(&study, 3, 5).is_empty());
}

#[tokio::test]
async fn test_statistics_serialize() {
    let (engine, _source) = setup_engine(TestFrameSource::new(), |_| {});
    let stats = serde_json::to_value(engine.statistics()).unwrap();
    assert_eq!(stats["hit_rate"], 0.0);
    assert_eq!(stats["pressure"], "low");
    assert_eq!(stats["quality_level"], 0);
}
