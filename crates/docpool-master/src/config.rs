//! Configuration Management
//!
//! Unified configuration for the master process: command-line arguments with
//! an optional YAML/JSON config file. Static after startup.
//!
//! ```text
//! MasterConfig
//!   ├─ ServerConfig  (worker sizing and spawning)
//!   ├─ LicenseConfig (license file and reload cadences)
//!   └─ LoggingConfig
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::capacity;
use crate::controller::LoopIntervals;

/// Master process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(name = "docpool-master")]
#[command(about = "Document service master - worker pool controller", long_about = None)]
#[serde(default)]
pub struct MasterConfig {
    #[command(flatten)]
    pub server: ServerConfig,

    #[command(flatten)]
    pub license: LicenseConfig,

    #[command(flatten)]
    pub logging: LoggingConfig,

    /// Optional: load settings from a YAML or JSON file
    #[arg(long, value_name = "FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

/// Worker sizing and spawning.
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
pub struct ServerConfig {
    /// Workers to run per detected CPU
    #[arg(long, default_value_t = 1.0)]
    pub workerpercpu: f64,

    /// Worker command to spawn (defaults to `docpool-worker` next to this binary)
    #[arg(long)]
    pub worker_bin: Option<PathBuf>,

    /// Extra argument passed to each worker (repeatable)
    #[arg(long = "worker-arg")]
    pub worker_args: Vec<String>,

    /// Override the detected CPU count (0 = detect from host)
    #[arg(long, default_value_t = 0)]
    pub cpu_count: usize,

    /// Worker exit sweep interval (milliseconds)
    #[arg(long, default_value_t = 1_000)]
    pub sweep_interval_ms: u64,
}

/// License file location and reload cadences.
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
pub struct LicenseConfig {
    /// Path to the license file
    #[arg(long, default_value = "/etc/docpool/license.json")]
    pub license_file: PathBuf,

    /// Periodic license re-check interval in seconds
    ///
    /// Runs independently of file-change detection as a fallback against
    /// missed filesystem notifications. Default: 24 hours.
    #[arg(long, default_value_t = 86_400)]
    pub reload_interval_secs: u64,

    /// License file change-poll interval in seconds
    #[arg(long, default_value_t = 5)]
    pub watch_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl MasterConfig {
    /// Load from command-line arguments, then from `--config-file` if given.
    pub fn load() -> Result<Self> {
        let mut config = Self::parse();

        if let Some(path) = config.config_file.clone() {
            let file_config = Self::from_file(&path)?;
            config.server = file_config.server;
            config.license = file_config.license;
            config.logging = file_config.logging;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML or JSON file, by extension.
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        let name = path.to_string_lossy();
        if name.ends_with(".yaml") || name.ends_with(".yml") {
            serde_yaml::from_str(&content).context("Failed to parse YAML config")
        } else if name.ends_with(".json") {
            serde_json::from_str(&content).context("Failed to parse JSON config")
        } else {
            anyhow::bail!("Unsupported config file format (use .yaml, .yml, or .json)")
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.server.workerpercpu.is_finite() || self.server.workerpercpu < 0.0 {
            anyhow::bail!("workerpercpu must be a non-negative finite number");
        }

        if self.license.reload_interval_secs == 0 {
            anyhow::bail!("reload_interval_secs must be greater than 0");
        }
        if self.license.watch_interval_secs == 0 {
            anyhow::bail!("watch_interval_secs must be greater than 0");
        }
        if self.server.sweep_interval_ms == 0 {
            anyhow::bail!("sweep_interval_ms must be greater than 0");
        }

        if self.license.license_file.as_os_str().is_empty() {
            anyhow::bail!("license_file is required");
        }

        match self.logging.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => anyhow::bail!(
                "Invalid log_level: {} (must be trace/debug/info/warn/error)",
                other
            ),
        }

        Ok(())
    }

    /// CPU count to size against: the configured override, or the host's.
    pub fn effective_cpu_count(&self) -> usize {
        if self.server.cpu_count > 0 {
            self.server.cpu_count
        } else {
            capacity::detect_cpu_count()
        }
    }

    /// Resolve the worker command: configured path, or the `docpool-worker`
    /// binary next to the master executable.
    pub fn resolve_worker_cmd(&self) -> Result<PathBuf> {
        if let Some(bin) = &self.server.worker_bin {
            return Ok(bin.clone());
        }

        let current_exe =
            std::env::current_exe().context("Failed to get current executable path")?;
        let exe_dir = current_exe
            .parent()
            .context("Failed to get executable directory")?;
        Ok(exe_dir.join("docpool-worker"))
    }

    /// Tick periods for the control loop.
    pub fn intervals(&self) -> LoopIntervals {
        LoopIntervals {
            reload: Duration::from_secs(self.license.reload_interval_secs),
            watch: Duration::from_secs(self.license.watch_interval_secs),
            sweep: Duration::from_millis(self.server.sweep_interval_ms),
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            license: LicenseConfig::default(),
            logging: LoggingConfig::default(),
            config_file: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workerpercpu: 1.0,
            worker_bin: None,
            worker_args: Vec::new(),
            cpu_count: 0,
            sweep_interval_ms: 1_000,
        }
    }
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            license_file: PathBuf::from("/etc/docpool/license.json"),
            reload_interval_secs: 86_400,
            watch_interval_secs: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
