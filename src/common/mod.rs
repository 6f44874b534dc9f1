//! Common utilities and types shared across clustermeta

pub mod config;
pub mod error;
pub mod utils;

pub use config::{ClusterConfig, Config, TagPolicy};
pub use error::{Error, Result};
pub use utils::{format_bytes, parse_duration, timestamp_now_micros, validate_address};
