//! Core system types and foundations
//!
//! This module contains error handling, configuration and logging setup
//! shared by every other part of the crate.

pub mod error;
pub mod config;
pub mod logging;

// Re-export commonly used items
pub use error::{Error, Result, SerializationError};
pub use config::Config;
