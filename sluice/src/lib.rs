//! Sluice is an agent that collects telemetry from sources, transforms and aggregates it over
//! time windows, and delivers it to sinks.
//!
//! This crate ties the workspace together: it defines the combined [`Config`], initializes
//! logging and internal metrics, and [runs](run) a pipeline until shutdown. Plugins are provided
//! by the embedding application through a [`PluginRegistry`].
//!
//! # Workspace Crates
//!
//!  - `sluice`: Configuration, setup and entry point.
//!  - [`sluice-log`]: Logging facade.
//!  - [`sluice-pipeline`]: Data model, windows, delivery tracking, plugin instances and the
//!    scheduler.
//!  - [`sluice-statsd`]: High-level StatsD metric client for internal measurements.
//!  - [`sluice-system`]: Task spawning and shutdown signalling.
//!  - [`sluice-test`]: Helpers for testing.
//!
//! # Example
//!
//! ```no_run
//! use sluice::Config;
//! use sluice_pipeline::PluginRegistry;
//! use sluice_system::Controller;
//!
//! # async fn example(config: Config) -> anyhow::Result<()> {
//! sluice::init_logging(&config);
//! sluice::init_metrics(&config)?;
//!
//! let controller = Controller::new();
//! let plugins = PluginRegistry::with_builtins();
//! sluice::run(&config, &plugins, controller.handle()).await
//! # }
//! ```
//!
//! [`sluice-log`]: ../sluice_log/index.html
//! [`sluice-pipeline`]: ../sluice_pipeline/index.html
//! [`sluice-statsd`]: ../sluice_statsd/index.html
//! [`sluice-system`]: ../sluice_system/index.html
//! [`sluice-test`]: ../sluice_test/index.html
#![warn(missing_docs)]

mod config;
mod setup;
mod statsd;

use std::sync::Arc;

use sluice_pipeline::{Pipeline, PluginRegistry, Scheduler, SystemClock};
use sluice_statsd::metric;
use sluice_system::ShutdownHandle;

pub use self::config::*;
pub use self::setup::*;

use self::statsd::SluiceCounters;

/// Builds the configured pipeline and runs it until `shutdown` is notified.
///
/// Instances that fail to initialize are logged, counted and skipped. Running fails only if the
/// configuration is rejected or no sink could be initialized.
pub async fn run(
    config: &Config,
    plugins: &PluginRegistry,
    shutdown: ShutdownHandle,
) -> anyhow::Result<()> {
    check_config(config)?;
    dump_spawn_infos(config);

    let (pipeline, errors) =
        Pipeline::from_config(&config.pipeline, plugins, Arc::new(SystemClock));

    for error in &errors {
        let kind = error
            .instance()
            .and_then(|instance| instance.split('.').next())
            .unwrap_or("unknown");
        metric!(counter(SluiceCounters::InstanceFailed) += 1, kind = kind);
    }

    if pipeline.sinks().is_empty() {
        anyhow::bail!(
            "none of the {} configured sinks could be initialized",
            config.pipeline.sinks.len()
        );
    }

    Scheduler::new(pipeline).run(shutdown).await;
    Ok(())
}
