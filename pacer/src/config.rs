use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    completion::CompletionTimeMode, error::ConfigError, metrics::QueueDiscipline,
    metrics::DEFAULT_HIGHEST_EXPECTED_RUNTIME, time::TimeUnit,
};

/// Workers, the dispatcher and shutdown all run on tokio's blocking pool, which holds
/// 512 threads unless the runtime is built with a larger limit.
pub const MAX_THREAD_COUNT: usize = 500;

/// Everything a [`crate::WorkloadRunner`] needs to know about a run.
///
/// Durations are written as integer milliseconds when (de)serialized. Missing keys
/// fall back to the defaults below, so a configuration file only needs to name what
/// it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct DriverConfig {
    /// Size of the worker pool, and so the most operations ever in flight.
    #[builder(default = num_cpus::get())]
    pub thread_count: usize,

    /// How late an operation may start before it is reported as excessively delayed.
    #[builder(default = Duration::from_secs(30 * 60))]
    #[serde(with = "duration_ms")]
    pub tolerated_execution_delay: Duration,

    /// Excessive delay becomes a fatal error instead of a warning.
    #[builder(default)]
    pub abort_on_excessive_delay: bool,

    /// Sleep between spinner polls. Zero yields instead of sleeping.
    #[builder(default = Duration::from_millis(1))]
    #[serde(with = "duration_ms")]
    pub spinner_sleep_duration: Duration,

    /// Smallest gap between an operation's timestamp and its dependency time that the
    /// time compression is expected to preserve. Closer dependencies are reported.
    #[builder(default = Duration::ZERO)]
    #[serde(with = "duration_ms")]
    pub compressed_gct_delta_duration: Duration,

    /// Multiplier applied to inter-operation gaps. Below 1 replays faster than recorded.
    #[builder(default = 1.0)]
    pub time_compression_ratio: f64,

    /// Gap between starting the runner and the first scheduled operation.
    #[builder(default = Duration::from_millis(100))]
    #[serde(with = "duration_ms")]
    pub start_delay: Duration,

    #[builder(default = Duration::from_secs(10))]
    #[serde(with = "duration_ms")]
    pub gct_init_timeout: Duration,

    #[builder(default)]
    pub ignore_scheduled_start_times: bool,

    #[builder(default)]
    pub completion_time_mode: CompletionTimeMode,

    /// Remote writers taking part in global completion time.
    #[builder(default)]
    pub peer_ids: Vec<String>,

    #[builder(default)]
    pub metrics_queue: QueueDiscipline,

    #[builder(default = 1024)]
    pub metrics_queue_capacity: usize,

    #[builder(default)]
    pub time_unit: TimeUnit,

    #[builder(default = DEFAULT_HIGHEST_EXPECTED_RUNTIME)]
    #[serde(with = "duration_ms")]
    pub highest_expected_runtime: Duration,

    #[builder(default = 100)]
    pub max_reported_errors: usize,

    /// Log a progress line at this interval while the workload runs.
    #[builder(default, setter(strip_option))]
    #[serde(with = "option_duration_ms", skip_serializing_if = "Option::is_none")]
    pub status_interval: Option<Duration>,

    /// Passed verbatim to [`crate::Db::init`].
    #[builder(default)]
    pub db_properties: BTreeMap<String, String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl DriverConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::debug!("Loading driver configuration from {}", path.display());
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.thread_count == 0 {
            return invalid("thread_count must be at least 1".into());
        }
        if self.thread_count > MAX_THREAD_COUNT {
            return invalid(format!(
                "thread_count must be at most {MAX_THREAD_COUNT}, got {}",
                self.thread_count
            ));
        }
        if self.metrics_queue_capacity == 0 {
            return invalid("metrics_queue_capacity must be at least 1".into());
        }
        if !(self.time_compression_ratio.is_finite() && self.time_compression_ratio > 0.0) {
            return invalid(format!(
                "time_compression_ratio must be positive, got {}",
                self.time_compression_ratio
            ));
        }
        if self.max_reported_errors == 0 {
            return invalid("max_reported_errors must be at least 1".into());
        }
        if self.highest_expected_runtime < Duration::from_millis(1) {
            return invalid("highest_expected_runtime must be at least 1ms".into());
        }
        if self.status_interval.is_some_and(|i| i.is_zero()) {
            return invalid("status_interval must not be zero".into());
        }

        let mut seen = BTreeSet::new();
        for peer in &self.peer_ids {
            if peer.is_empty() {
                return invalid("peer ids must not be empty".into());
            }
            if !seen.insert(peer.as_str()) {
                return invalid(format!("duplicate peer id {peer:?}"));
            }
        }
        Ok(())
    }
}

/// Turns per operation type frequencies into interleaves: how many update
/// intervals pass between two operations of that type.
///
/// `interleave = frequency * update_interleave`
pub fn frequencies_to_interleaves(
    frequencies: &BTreeMap<String, u64>,
    update_interleave: u64,
) -> BTreeMap<String, u64> {
    frequencies
        .iter()
        .map(|(op, frequency)| (op.clone(), frequency.saturating_mul(update_interleave)))
        .collect()
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => super::duration_ms::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = DriverConfig::from_json_str(
            r#"{
                "thread_count": 4,
                "tolerated_execution_delay": 250,
                "metrics_queue": "non_blocking",
                "completion_time_mode": "queued",
                "status_interval": 1000,
                "db_properties": { "url": "localhost:7687" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.thread_count, 4);
        assert_eq!(config.tolerated_execution_delay, Duration::from_millis(250));
        assert_eq!(config.metrics_queue, QueueDiscipline::NonBlocking);
        assert_eq!(config.completion_time_mode, CompletionTimeMode::Queued);
        assert_eq!(config.status_interval, Some(Duration::from_secs(1)));
        assert_eq!(config.db_properties["url"], "localhost:7687");
        assert_eq!(config.spinner_sleep_duration, Duration::from_millis(1));
        assert_eq!(config.time_compression_ratio, 1.0);
    }

    #[test]
    fn serialized_config_reads_back() {
        let config = DriverConfig::builder()
            .thread_count(3)
            .start_delay(Duration::from_millis(5))
            .peer_ids(vec!["east".into()])
            .build();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"start_delay\":5"));
        assert!(!json.contains("status_interval"));
        assert_eq!(DriverConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn rejects_invalid_values() {
        let cases = [
            DriverConfig::builder().thread_count(0).build(),
            DriverConfig::builder().thread_count(MAX_THREAD_COUNT + 1).build(),
            DriverConfig::builder().metrics_queue_capacity(0).build(),
            DriverConfig::builder().time_compression_ratio(0.0).build(),
            DriverConfig::builder().time_compression_ratio(f64::NAN).build(),
            DriverConfig::builder()
                .peer_ids(vec!["a".into(), "a".into()])
                .build(),
            DriverConfig::builder().status_interval(Duration::ZERO).build(),
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "accepted {config:?}"
            );
        }
        DriverConfig::default().validate().unwrap();
    }

    #[test]
    fn unparsable_json_is_a_parse_error() {
        assert!(matches!(
            DriverConfig::from_json_str("{ thread_count: 2 }"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn interleave_is_frequency_times_update_interleave() {
        let frequencies = BTreeMap::from([("q1".to_string(), 26), ("q2".to_string(), 37)]);
        let interleaves = frequencies_to_interleaves(&frequencies, 3);
        assert_eq!(interleaves["q1"], 78);
        assert_eq!(interleaves["q2"], 111);
    }
}
