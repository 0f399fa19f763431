//! The sluice pipeline runtime.
//!
//! Sources collect [`DataPoint`]s through an [`Accumulator`]. The [`Router`] passes them through
//! processors and aggregators and hands them to every interested sink. Aggregators fold points
//! into time windows and emit aggregates when a window closes. Sinks buffer points and write them
//! in batches.
//!
//! Producers that need to know whether their points were delivered track them in the
//! [`TrackingRegistry`]. Each sink that receives a tracked point reports exactly one outcome, and
//! the producer is notified once all outcomes are in.
//!
//! A [`Pipeline`] is built from a [`PipelineConfig`] and a [`PluginRegistry`], and driven by the
//! [`Scheduler`] until shutdown.
#![warn(missing_docs)]

mod accumulator;
mod aggregation;
mod aggregator;
mod clock;
mod config;
mod error;
mod fanout;
mod filter;
mod point;
mod processor;
mod registry;
mod router;
mod scheduler;
mod sink;
mod source;
mod statsd;
mod tracking;
mod window;

pub use self::accumulator::*;
pub use self::aggregation::*;
pub use self::aggregator::*;
pub use self::clock::*;
pub use self::config::*;
pub use self::error::*;
pub use self::fanout::*;
pub use self::filter::*;
pub use self::point::*;
pub use self::processor::*;
pub use self::registry::*;
pub use self::router::*;
pub use self::scheduler::*;
pub use self::sink::*;
pub use self::source::*;
pub use self::tracking::*;
pub use self::window::*;
