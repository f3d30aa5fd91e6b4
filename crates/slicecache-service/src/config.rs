use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::EvictionPolicy;
use crate::types::QualityLevel;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the engine.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "slicecache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Sizing and eviction of the in-memory frame cache.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// The memory budget for all cached payloads, in bytes.
    pub max_memory_bytes: u64,
    /// Selects the weights used to rank entries for eviction.
    pub eviction_policy: EvictionPolicy,
    /// Occupancy (in percent of `max_memory_bytes`) at which memory pressure counts as high.
    ///
    /// Clamped to `50..=95`.
    pub memory_pressure_threshold: u8,
}

impl CacheConfig {
    /// The pressure threshold as a fraction of the budget.
    pub fn pressure_threshold(&self) -> f64 {
        f64::from(self.memory_pressure_threshold.clamp(50, 95)) / 100.0
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 512 * 1024 * 1024,
            eviction_policy: EvictionPolicy::default(),
            memory_pressure_threshold: 80,
        }
    }
}

/// Backoff between retries of a failed fetch.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total number of fetch attempts per request, including the first one.
    pub attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Growth of the delay with every further retry.
    pub backoff_factor: f64,
    /// Upper bound of the exponential part of the delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Upper bound of the random delay added on top.
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: Duration::from_millis(100),
        }
    }
}

/// Scheduling of frame loads.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoadConfig {
    /// Fixed number of concurrent loads.
    ///
    /// When unset, the limit is derived from the size of the active study.
    pub max_concurrent_loads: Option<usize>,
    /// Timeout of a single fetch attempt.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loads: None,
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Navigation tracking and prefetch prediction.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Number of slices to prefetch at navigation speed 1 slice/s.
    pub window_size: usize,
    /// Number of observations kept per study.
    pub history_size: usize,
    /// Lower bound of the velocity factor applied to `window_size`.
    pub min_velocity_scale: f64,
    /// Upper bound of the velocity factor applied to `window_size`.
    pub max_velocity_scale: f64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            history_size: 10,
            min_velocity_scale: 0.5,
            max_velocity_scale: 2.0,
        }
    }
}

/// Memory pressure sampling.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct PressureConfig {
    /// Render time above which the renderer is considered to be struggling.
    #[serde(with = "humantime_serde")]
    pub target_frame_time: Duration,
    /// Number of render time samples that are averaged.
    pub latency_window: usize,
    /// Interval of background pressure sampling. Sampling only happens on request when unset.
    #[serde(with = "humantime_serde")]
    pub sample_interval: Option<Duration>,
    /// Fraction of the budget below the pressure threshold that a relief pass evicts down to.
    pub relief: f64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            target_frame_time: Duration::from_millis(33),
            latency_window: 30,
            sample_interval: Some(Duration::from_secs(1)),
            relief: 0.1,
        }
    }
}

/// Quality degradation under memory pressure.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct QualityConfig {
    /// The coarsest level requests are degraded to.
    pub coarsest_level: QualityLevel,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            coarsest_level: QualityLevel::new(3),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    pub cache: CacheConfig,

    pub loads: LoadConfig,

    pub prefetch: PrefetchConfig,

    pub pressure: PressureConfig,

    pub quality: QualityConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_partial_sections() {
        // It should be possible to set individual options without
        // affecting the defaults of their siblings.
        let yaml = r#"
            cache:
              max_memory_bytes: 10485760
            loads:
              retry:
                base_delay: 50ms
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache.max_memory_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.cache.eviction_policy, EvictionPolicy::Balanced);
        assert_eq!(cfg.loads.retry.base_delay, Duration::from_millis(50));
        assert_eq!(cfg.loads.retry.attempts, 3);
        assert_eq!(cfg.loads.timeout, Duration::from_secs(30));
        assert_eq!(cfg.prefetch, PrefetchConfig::default());
    }

    #[test]
    fn test_eviction_policy_names() {
        let yaml = r#"
            cache:
              eviction_policy: footprint
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache.eviction_policy, EvictionPolicy::Footprint);

        let yaml = r#"
            cache:
              eviction_policy: random
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_pressure_threshold_clamped() {
        let mut cache = CacheConfig {
            memory_pressure_threshold: 20,
            ..Default::default()
        };
        assert_eq!(cache.pressure_threshold(), 0.5);
        cache.memory_pressure_threshold = 100;
        assert_eq!(cache.pressure_threshold(), 0.95);
        cache.memory_pressure_threshold = 80;
        assert_eq!(cache.pressure_threshold(), 0.8);
    }

    #[test]
    fn test_disabling_background_sampling() {
        let yaml = r#"
            pressure:
              sample_interval: null
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.pressure.sample_interval, None);
        assert_eq!(
            cfg.pressure.target_frame_time,
            PressureConfig::default().target_frame_time
        );
    }

    #[test]
    fn test_read_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "quality:\n  coarsest_level: 2\nlogging:\n  level: debug").unwrap();

        let cfg = Config::get(Some(file.path())).unwrap();
        assert_eq!(cfg.quality.coarsest_level, QualityLevel::new(2));
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            cache:
              not_an_option: 1
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
