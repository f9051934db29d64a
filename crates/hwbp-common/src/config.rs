//! Runtime configuration
//!
//! Every field has a default, so an empty document is a valid config:
//!
//! ```toml
//! propagate_to_new_threads = true
//! thread_entry_module = "kernel32.dll"
//! thread_entry_export = "BaseThreadInitThunk"
//!
//! [logging]
//! level = "debug"
//! ```

use crate::error::{Error, Result};
use crate::logging::{self, LogConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwbpConfig {
    /// Install the thread-entry hook so `AllThreads` breakpoints reach
    /// threads started after they were created.
    #[serde(default = "default_true")]
    pub propagate_to_new_threads: bool,

    #[serde(default = "default_thread_entry_module")]
    pub thread_entry_module: String,

    #[serde(default = "default_thread_entry_export")]
    pub thread_entry_export: String,

    /// Register the exception handler at the head of the vectored chain
    #[serde(default = "default_true")]
    pub first_handler: bool,

    /// When a single-step trap matches no breakpoint by address or by DR6,
    /// offer it to every data watch instead of passing it on.
    #[serde(default)]
    pub broadcast_untracked_single_step: bool,

    /// Applied by [`HwbpConfig::init_logging`]. The library itself never
    /// installs a subscriber.
    #[serde(default)]
    pub logging: LogConfig,
}

fn default_true() -> bool {
    true
}

fn default_thread_entry_module() -> String {
    "kernel32.dll".to_string()
}

fn default_thread_entry_export() -> String {
    "BaseThreadInitThunk".to_string()
}

impl Default for HwbpConfig {
    fn default() -> Self {
        Self {
            propagate_to_new_threads: true,
            thread_entry_module: default_thread_entry_module(),
            thread_entry_export: default_thread_entry_export(),
            first_handler: true,
            broadcast_untracked_single_step: false,
            logging: LogConfig::default(),
        }
    }
}

impl HwbpConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Reject configs that would make the thread-entry hook unresolvable.
    pub fn validate(&self) -> Result<()> {
        if self.propagate_to_new_threads {
            if self.thread_entry_module.trim().is_empty() {
                return Err(Error::Config("thread_entry_module is empty".into()));
            }
            if self.thread_entry_export.trim().is_empty() {
                return Err(Error::Config("thread_entry_export is empty".into()));
            }
        }
        Ok(())
    }

    /// Install the global `tracing` subscriber from the `[logging]` table.
    pub fn init_logging(&self) {
        logging::init_logging(&self.logging);
    }

    pub fn without_thread_propagation(mut self) -> Self {
        self.propagate_to_new_threads = false;
        self
    }
}
