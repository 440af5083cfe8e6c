//! Shared configuration, constructed once at startup and threaded by
//! reference into every actor constructor — never a process-global.
//!
//! Matches the layered-config idiom used across the pack: a plain `serde`
//! struct with defaults, deserialized from whatever format the embedding
//! process chooses (TOML, env, JSON), then validated once before any loop
//! starts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::CorrelationRule;

/// Every tunable named in the external interfaces, plus adapter endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default correlation window for rules that don't override it.
    pub correlation_window_seconds: f64,
    /// `read_group` batch size.
    pub event_batch_size: u32,
    /// Sliding-window buffer size cap.
    pub max_pending_events: usize,
    /// Archiver cycle period.
    pub archival_interval_seconds: u64,
    /// Retention cutoff relative to now.
    pub redis_ttl_seconds: u64,
    /// Archiver per-stream per-cycle read cap.
    pub max_events_per_archive_batch: u32,
    /// Opaque input stream identifiers.
    pub input_streams: Vec<String>,
    /// Name of the stream multi events are appended to.
    pub integrated_stream: String,
    /// Consumer group shared by all CEP workers.
    pub consumer_group: String,
    /// Broker connection string.
    pub broker_url: String,
    /// Cold store connection string.
    pub cold_store_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            correlation_window_seconds: 2.0,
            event_batch_size: 10,
            max_pending_events: 100,
            archival_interval_seconds: 60,
            redis_ttl_seconds: 300,
            max_events_per_archive_batch: 1000,
            input_streams: Vec::new(),
            integrated_stream: "integrated".to_owned(),
            consumer_group: "cep-workers".to_owned(),
            broker_url: String::new(),
            cold_store_url: String::new(),
        }
    }
}

impl Config {
    /// Validates every knob, failing fast with [`Error::Config`] before any
    /// actor is constructed.
    pub fn validate(&self) -> Result<(), Error> {
        if !(0.1..=60.0).contains(&self.correlation_window_seconds) {
            return Err(Error::Config(format!(
                "correlation_window_seconds must be within [0.1, 60.0], got {}",
                self.correlation_window_seconds
            )));
        }
        if self.event_batch_size == 0 {
            return Err(Error::Config("event_batch_size must be positive".to_owned()));
        }
        if self.max_pending_events == 0 {
            return Err(Error::Config("max_pending_events must be positive".to_owned()));
        }
        if self.archival_interval_seconds == 0 {
            return Err(Error::Config(
                "archival_interval_seconds must be positive".to_owned(),
            ));
        }
        if self.redis_ttl_seconds == 0 {
            return Err(Error::Config("redis_ttl_seconds must be positive".to_owned()));
        }
        if self.max_events_per_archive_batch == 0 {
            return Err(Error::Config(
                "max_events_per_archive_batch must be positive".to_owned(),
            ));
        }
        if self.input_streams.is_empty() {
            return Err(Error::Config("input_streams must not be empty".to_owned()));
        }
        if self.input_streams.contains(&self.integrated_stream) {
            return Err(Error::Config(
                "integrated_stream must be distinct from every input stream".to_owned(),
            ));
        }
        Ok(())
    }

    /// The default correlation window as a [`Duration`], for rules that
    /// don't specify their own.
    #[must_use]
    pub fn default_window(&self) -> Duration {
        Duration::from_secs_f64(self.correlation_window_seconds)
    }

    /// The retention cutoff as a [`Duration`].
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.redis_ttl_seconds)
    }

    /// The archival cycle period as a [`Duration`].
    #[must_use]
    pub fn archival_interval(&self) -> Duration {
        Duration::from_secs(self.archival_interval_seconds)
    }

    /// The maximum `window_duration` across a set of rules and this
    /// config's default, used to size the sliding-window buffer's prune
    /// horizon (§4.4).
    #[must_use]
    pub fn max_window(&self, rules: &[CorrelationRule]) -> Duration {
        rules
            .iter()
            .map(|r| r.window_duration)
            .max()
            .unwrap_or_else(|| self.default_window())
            .max(self.default_window())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            input_streams: vec!["s1".to_owned(), "s2".to_owned()],
            ..Config::default()
        }
    }

    #[test]
    fn default_config_with_streams_validates() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn empty_input_streams_is_rejected() {
        let config = Config::default();
        let err = config.validate().expect_err("empty input_streams must fail");
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn integrated_stream_colliding_with_input_is_rejected() {
        let mut config = valid_config();
        config.integrated_stream = "s1".to_owned();
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_window_is_rejected() {
        let mut config = valid_config();
        config.correlation_window_seconds = 120.0;
        assert!(config.validate().is_err());
    }
}
