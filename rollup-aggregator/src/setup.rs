use std::io;

use rollup_log::LogConfig;
use rollup_statsd::MetricsConfig;
use serde::{Deserialize, Serialize};

use crate::config::{AggregatorConfig, Options};

/// Configuration of an aggregator process.
///
/// Every section is optional and falls back to its defaults.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RollupConfig {
    /// Log level and output format.
    pub logging: LogConfig,
    /// Internal statsd metrics.
    pub metrics: MetricsConfig,
    /// Aggregation and flush parameters.
    pub aggregator: AggregatorConfig,
}

impl RollupConfig {
    /// Returns aggregator options with a flush manager, both configured from this config.
    pub fn options(&self) -> Options {
        Options::from_config(&self.aggregator).with_config_flush_manager(&self.aggregator)
    }
}

/// An error initializing an aggregator process.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// The statsd client could not be created.
    #[error("failed to initialize metrics")]
    Metrics(#[source] io::Error),
}

/// Initializes logging and internal metrics.
///
/// Call once at startup, before the [`Aggregator`](crate::Aggregator) is opened. Metrics stay
/// disabled if no statsd address is configured.
pub fn init(config: &RollupConfig) -> Result<(), SetupError> {
    rollup_log::init(&config.logging);
    let metrics = rollup_statsd::init(&config.metrics).map_err(SetupError::Metrics)?;

    rollup_log::info!(
        level = ?config.logging.level,
        metrics,
        workers = config.aggregator.num_workers,
        "initialized aggregator process"
    );

    Ok(())
}
