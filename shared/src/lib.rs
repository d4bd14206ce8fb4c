//! Multi-threaded one-sided put benchmark.
//!
//! Thread `i` of the source process (even rank) writes into slot `i` of a
//! region exposed by the sink process (odd rank), issuing a window of puts
//! followed by one flush, first as a warm-up and then timed. The source
//! prints per-thread and summed message rate and bandwidth.

pub mod atomic_extension;
pub mod barrier;
pub mod command_line;
pub mod config;
pub mod engine;
pub mod error;
pub mod fabric;
pub mod memory_region;
pub mod report;
pub mod role;

#[cfg(feature = "verbs")]
pub mod rdma_controller;

pub use config::{BenchParams, RunConfig};
pub use engine::{run, Session};
pub use error::{BenchError, ConfigError, Result};
pub use fabric::{Fabric, Threading, TransferHandle};
pub use report::Report;
pub use role::Role;
