//! Shared types, errors, configuration and logging for hwbp.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::HwbpConfig;
pub use error::{Error, Result};
pub use logging::{get_log_file_path, init_debug_logging, init_logging, LogConfig};
pub use types::*;
