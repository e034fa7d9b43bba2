//! AMT CLI Library
//!
//! Shared functionality for AMT command-line tools.

pub mod config;
pub mod output;
pub mod stats;

pub use config::{CliConfig, ConfigError};
pub use output::{OutputTarget, StreamSink};
pub use stats::{
    display_compact_stats, display_interface_stats, format_bandwidth, format_bytes,
    format_duration, OutputStats,
};
