use anyhow::Result;
use sluice_statsd::MetricsConfig;

use crate::config::Config;

/// Rejects configurations that cannot run a useful pipeline.
pub fn check_config(config: &Config) -> Result<()> {
    if config.pipeline.sinks.is_empty() {
        anyhow::bail!("no sinks configured, every collected point would be dropped");
    }

    let sample_rate = config.metrics.sample_rate;
    if !(0.0..=1.0).contains(&sample_rate) {
        anyhow::bail!("metrics sample rate must be between 0.0 and 1.0, got {sample_rate}");
    }

    Ok(())
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    let pipeline = &config.pipeline;
    sluice_log::info!("launching sluice");
    sluice_log::info!("  log level: {}", config.logging.level);
    sluice_log::info!("  interval: {}s", pipeline.agent.interval);
    sluice_log::info!("  flush interval: {}s", pipeline.agent.flush_interval);
    sluice_log::info!(
        "  instances: {} sources, {} processors, {} aggregators, {} sinks",
        pipeline.sources.len(),
        pipeline.processors.len(),
        pipeline.aggregators.len(),
        pipeline.sinks.len()
    );
}

/// Initialize the logging system.
pub fn init_logging(config: &Config) {
    sluice_log::init(&config.logging);
}

/// Initialize the metric system.
pub fn init_metrics(config: &Config) -> Result<()> {
    let Some(ref host) = config.metrics.statsd else {
        return Ok(());
    };

    sluice_statsd::init(MetricsConfig {
        prefix: config.metrics.prefix.clone(),
        host: host.clone(),
        buffer_size: config.metrics.buffer_size,
        default_tags: config.metrics.default_tags.clone(),
        sample_rate: config.metrics.sample_rate,
    })?;

    Ok(())
}
