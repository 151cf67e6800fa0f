//! Configuration Module
//!
//! Provides TOML-based configuration for netsentry.
//! Configuration is optional - CLI arguments can override file settings.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureSettings,
    pub detection: DetectionSettings,
    pub model: ModelSettings,
}

impl Config {
    /// Loads configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Loads configuration from file if it exists, otherwise returns defaults
    pub fn load_or_default(path: Option<&Path>) -> Self {
        match path {
            Some(p) => Self::load(p).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }),
            None => Self::default(),
        }
    }

    /// Generates a default configuration file content
    #[allow(dead_code)] // For a config-init subcommand
    pub fn generate_default() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config)
            .unwrap_or_else(|_| "# Failed to generate config".to_string())
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.detection.training_packets == 0 {
            anyhow::bail!("training_packets must be greater than 0");
        }
        if self.detection.portscan_count == 0 || self.detection.hostscan_count == 0 {
            anyhow::bail!("scan thresholds must be greater than 0");
        }
        if self.detection.flood_count == 0 {
            anyhow::bail!("flood_count must be greater than 0");
        }
        if self.detection.portscan_window_secs == 0
            || self.detection.hostscan_window_secs == 0
            || self.detection.flood_window_secs == 0
        {
            anyhow::bail!("detection windows must be greater than 0 seconds");
        }
        if self.detection.max_tracked_sources == 0 || self.detection.max_tracked_targets == 0 {
            anyhow::bail!("tracker arena bounds must be greater than 0");
        }
        Ok(())
    }
}

/// Capture-related configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Network interface to capture on (None = auto-detect)
    pub interface: Option<String>,
    /// BPF filter expression
    pub filter: Option<String>,
    /// Enable promiscuous mode
    pub promiscuous: bool,
    /// Capture timeout in milliseconds (shutdown flag poll granularity)
    pub timeout_ms: i32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interface: None,
            filter: None,
            promiscuous: true,
            timeout_ms: 100,
        }
    }
}

/// Detection thresholds and windows for the behavioral and statistical layers
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// Feature vectors buffered before the statistical model is fitted
    pub training_packets: usize,
    /// Distinct destination ports from one source that constitute a port scan
    pub portscan_count: usize,
    /// Port scan observation window in seconds
    pub portscan_window_secs: u64,
    /// Distinct destination hosts on one port that constitute a host scan
    pub hostscan_count: usize,
    /// Host scan observation window in seconds
    pub hostscan_window_secs: u64,
    /// Packets to a single (ip, protocol, port) that constitute a flood
    pub flood_count: usize,
    /// Flood observation window in seconds
    pub flood_window_secs: u64,
    /// Maximum source IPs tracked for scan detection (LRU eviction)
    pub max_tracked_sources: usize,
    /// Maximum (ip, protocol, port) keys tracked for flood detection (LRU eviction)
    pub max_tracked_targets: usize,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            training_packets: 1000,
            portscan_count: 20,
            portscan_window_secs: 10,
            hostscan_count: 20,
            hostscan_window_secs: 10,
            flood_count: 500,
            flood_window_secs: 2,
            max_tracked_sources: 10_000,
            max_tracked_targets: 10_000,
        }
    }
}

/// Locations of the persisted model artifacts
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Trained model blob
    pub model_path: String,
    /// Explanatory statistics document
    pub stats_path: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: "netsentry_model.bin".to_string(),
            stats_path: "netsentry_stats.json".to_string(),
        }
    }
}
