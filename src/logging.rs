//! Logging setup
//!
//! `env_logger` with the level taken from the `logLevel` setting. `RUST_LOG`
//! still wins when set.

use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::warn;
use std::fs::{self, OpenOptions};
use std::path::Path;

use crate::config::DEFAULT_LOG_LEVEL;

const LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

/// Canonical spelling of a level name, if it is one.
pub fn normalize_level(level: &str) -> Option<&'static str> {
    let level = level.trim().to_ascii_lowercase();
    let level = match level.as_str() {
        "warning" => "warn",
        "verbose" => "debug",
        other => other,
    };
    LEVELS.iter().copied().find(|l| *l == level)
}

/// Install the global logger, writing to stderr or appending to `log_file`.
pub fn init(level: &str, log_file: Option<&Path>) -> Result<()> {
    let normalized = normalize_level(level);
    let filter = normalized.unwrap_or(DEFAULT_LOG_LEVEL);
    let mut builder = Builder::from_env(Env::default().default_filter_or(filter));

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder.target(Target::Pipe(Box::new(file)));
            builder.format_timestamp_secs();
        }
        None => {
            builder.format_timestamp(None);
        }
    }

    builder.try_init().context("Logger already initialized")?;

    if normalized.is_none() {
        warn!("Unknown log level {level:?}, using {DEFAULT_LOG_LEVEL}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_level() {
        assert_eq!(normalize_level("info"), Some("info"));
        assert_eq!(normalize_level(" DEBUG "), Some("debug"));
        assert_eq!(normalize_level("warning"), Some("warn"));
        assert_eq!(normalize_level("verbose"), Some("debug"));
        assert_eq!(normalize_level("loud"), None);
        assert_eq!(normalize_level(""), None);
    }

    #[test]
    fn test_default_level_is_canonical() {
        assert_eq!(normalize_level(DEFAULT_LOG_LEVEL), Some(DEFAULT_LOG_LEVEL));
    }
}
