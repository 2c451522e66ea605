//! # Observability
//!
//! Structured logging and counters for the live query engine. All dispatch-
//! time failures surface here as telemetry; clients never see them.

pub mod logger;
pub mod metrics;

pub use logger::{Logger, Severity};
pub use metrics::LiveQueryMetrics;
