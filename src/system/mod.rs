//! System utilities and monitoring
//!
//! This module contains the Prometheus metrics exported by the orchestrator.

pub mod metrics;

pub use metrics::{gather, Metrics};
