//! Foundational runtime components for the sluice pipeline.
//!
//! This crate contains the instrumented [`spawn!`] macro used for every long-running task of
//! the pipeline, and the [`Controller`] which coordinates graceful shutdown between them.
#![warn(missing_docs)]

mod controller;
mod runtime;
mod statsd;

pub use self::controller::*;
pub use self::runtime::*;
