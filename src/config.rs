//! Application configuration management.
//!
//! This module handles loading and saving application-wide settings: the
//! index database location, the default worker count, and the busy-retry
//! tuning. CLI flags always win over the config file; the config file wins
//! over built-in defaults.

use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::index::RetryPolicy;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Index database path. `None` means the platform data directory.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Default worker thread count for scan and audit.
    #[serde(default)]
    pub threads: Option<usize>,
    /// Maximum attempts for busy-database retries.
    #[serde(default)]
    pub retry_max_attempts: Option<u32>,
    /// Delay between busy-database retries, in milliseconds.
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
}

impl Config {
    /// Load the configuration from the default platform-specific path.
    pub fn load() -> Self {
        match Self::load_internal() {
            Ok(config) => config,
            Err(e) => {
                log::debug!("Failed to load config, using defaults: {}", e);
                Self::default()
            }
        }
    }

    fn load_internal() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save the configuration to the default platform-specific path.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Retry policy from config values, with overrides applied on top.
    #[must_use]
    pub fn retry_policy(&self, attempts: Option<u32>, delay_ms: Option<u64>) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: attempts
                .or(self.retry_max_attempts)
                .unwrap_or(defaults.max_attempts),
            delay: delay_ms
                .or(self.retry_delay_ms)
                .map_or(defaults.delay, Duration::from_millis),
        }
    }

    /// Get the default platform-specific configuration path.
    fn config_path() -> Result<PathBuf> {
        let project_dirs = project_dirs()?;
        Ok(project_dirs.config_dir().join("config.json"))
    }
}

/// Default location of the index database (platform data directory).
pub fn default_db_path() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().join("index.db"))
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "dupindex", "dupindex")
        .ok_or_else(|| anyhow::anyhow!("Failed to determine project directories"))
}
