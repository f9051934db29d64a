//! Error types for hwbp

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Breakpoint {0} is already armed")]
    AlreadyArmed(u32),

    #[error("No free debug register slot on thread {thread_id}")]
    ResourceExhausted { thread_id: u32 },

    #[error("Condition {0} is not supported by the hardware")]
    UnsupportedCondition(String),

    #[error("{call} failed: {message}")]
    OsCall { call: &'static str, message: String },

    #[error("Failed to allocate {size} bytes of executable memory")]
    Allocation { size: usize },

    #[error("Memory access error at {address:#x}: {message}")]
    MemoryAccess { address: usize, message: String },

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Export not found: {module}!{export}")]
    ExportNotFound { module: String, export: String },

    #[error("Failed to decode instruction at {address:#x}")]
    Decode { address: usize },

    #[error("Relocation error: {0}")]
    Relocation(String),

    #[error("Not supported on this platform: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a failed OS call, carrying the OS error text.
    pub fn os(call: &'static str, err: impl std::fmt::Display) -> Self {
        Error::OsCall {
            call,
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Config(e.to_string())
    }
}
