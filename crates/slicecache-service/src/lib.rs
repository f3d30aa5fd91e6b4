//! Adaptive frame cache, predictive prefetch and batch-load coordination for multi-slice
//! image series.
//!
//! The entry point is [`engine::FrameEngine`], which is created once per viewer session and
//! owns the [`caching::CacheStore`], the [`navigation`] model, the
//! [`loader::BatchLoadCoordinator`] and the [`pressure`] monitor.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod engine;
pub mod error;
pub mod loader;
pub mod logging;
pub mod navigation;
pub mod pressure;
pub mod types;
