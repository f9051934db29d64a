//! Logging setup
//!
//! The library only emits `tracing` events. Hosts that want them on stderr
//! or in a file call [`init_logging`] once at startup.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

/// Open log file, shared by every writer the file layer hands out
static FILE_LOGGER: Mutex<Option<(PathBuf, File)>> = Mutex::new(None);

/// `[logging]` table of the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Write events to stderr
    #[serde(default = "default_true")]
    pub console_enabled: bool,

    /// Append events to `file_path`
    #[serde(default)]
    pub file_enabled: bool,

    #[serde(default = "default_log_path")]
    pub file_path: String,

    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include source file and line
    #[serde(default)]
    pub file_info: bool,

    #[serde(default = "default_true")]
    pub show_target: bool,

    #[serde(default = "default_true")]
    pub ansi_colors: bool,

    /// Filter directive, overridden by `RUST_LOG` when set
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_log_path() -> String {
    "hwbp.log".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enabled: true,
            file_enabled: false,
            file_path: default_log_path(),
            timestamps: true,
            file_info: false,
            show_target: true,
            ansi_colors: true,
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// Verbose output with source locations
    pub fn debug() -> Self {
        Self {
            level: "debug".to_string(),
            file_info: true,
            ..Default::default()
        }
    }

    /// Plain output for processes we were loaded into, where the console
    /// may not understand ANSI sequences
    pub fn minimal() -> Self {
        Self {
            timestamps: false,
            show_target: false,
            ansi_colors: false,
            ..Default::default()
        }
    }

    pub fn with_file(mut self, path: &str) -> Self {
        self.file_enabled = true;
        self.file_path = path.to_string();
        self
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    pub fn get_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

fn file_writer() -> Box<dyn Write + Send> {
    if let Ok(guard) = FILE_LOGGER.lock() {
        if let Some((_, file)) = guard.as_ref() {
            if let Ok(f) = file.try_clone() {
                return Box::new(f);
            }
        }
    }
    Box::new(std::io::sink())
}

fn open_log_file(path: &str) -> bool {
    let Ok(file) = OpenOptions::new().create(true).append(true).open(path) else {
        return false;
    };
    match FILE_LOGGER.lock() {
        Ok(mut guard) => {
            *guard = Some((PathBuf::from(path), file));
            true
        }
        Err(_) => false,
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn file_layer(config: &LogConfig) -> BoxedLayer {
    fmt::layer()
        .with_ansi(false)
        .with_target(config.show_target)
        .with_file(config.file_info)
        .with_line_number(config.file_info)
        .with_writer(file_writer)
        .boxed()
}

fn console_layer(config: &LogConfig) -> BoxedLayer {
    let layer = fmt::layer()
        .with_ansi(config.ansi_colors)
        .with_target(config.show_target)
        .with_file(config.file_info)
        .with_line_number(config.file_info)
        .with_writer(std::io::stderr);
    if config.timestamps {
        layer.boxed()
    } else {
        layer.without_time().boxed()
    }
}

/// Install the global subscriber described by `config`.
///
/// Only the first call in a process installs anything; later calls are
/// ignored by `tracing`.
pub fn init_logging(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file_enabled =
        config.file_enabled && !config.file_path.is_empty() && open_log_file(&config.file_path);

    let mut layers: Vec<BoxedLayer> = vec![filter.boxed()];
    if config.console_enabled {
        layers.push(console_layer(config));
    }
    if file_enabled {
        layers.push(file_layer(config));
    }

    let subscriber = tracing_subscriber::registry().with(layers);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

pub fn init_debug_logging() {
    init_logging(&LogConfig::debug());
}

/// Path of the log file, if file logging was set up
pub fn get_log_file_path() -> Option<PathBuf> {
    FILE_LOGGER
        .lock()
        .ok()
        .and_then(|guard| guard.as_ref().map(|(path, _)| path.clone()))
}
