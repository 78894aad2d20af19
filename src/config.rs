//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - scheduler.toml (default configuration)
//! - scheduler.local.toml (git-ignored local overrides)
//! - Environment variables (LAZYLAYER_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # scheduler.toml
//! [fusion]
//! multioutput = true
//! fuse_arange = false
//!
//! [split]
//! reduceop_split_threshold = 32768
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! LAZYLAYER_FUSION__MULTIOUTPUT=false
//! LAZYLAYER_SPLIT__REDUCEOP_SPLIT_THRESHOLD=1024
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub split: SplitConfig,
    #[serde(default)]
    pub persist: PersistConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which fusions the realization decision is allowed to make
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Co-group outputs that reduce over the same op into one kernel
    #[serde(default = "default_true")]
    pub multioutput: bool,

    /// Lower through the pattern rewriter instead of the ad-hoc reduce
    /// planner
    #[serde(default)]
    pub ast_rewrite: bool,

    /// Fold constant-source reduces into their downstream kernels
    #[serde(default)]
    pub fuse_arange: bool,

    /// Fuse a reduce of a reduce of the same kind into one kernel
    #[serde(default)]
    pub fuse_conv_bw: bool,

    /// Materialize same-device copies as byte-move kernels
    #[serde(default)]
    pub use_copy_kernel: bool,
}

/// Large-reduce splitting thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// A reduce whose input-to-output volume ratio reaches this splits
    /// into a two-pass kernel
    #[serde(default = "default_split_threshold")]
    pub reduceop_split_threshold: i64,

    /// log2 of the element budget used to size the split divisor
    #[serde(default = "default_split_size")]
    pub reduceop_split_size: u32,
}

/// Schedule snapshot and ops-log destinations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistConfig {
    /// Record every schedule and flush it when the scheduler drops
    #[serde(default)]
    pub save_schedule: bool,

    /// Snapshot destination
    #[serde(default = "default_schedule_path")]
    pub save_schedule_path: PathBuf,

    /// Append each emitted kernel AST to this file
    #[serde(default)]
    pub logops: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_split_threshold() -> i64 {
    32768
}
fn default_split_size() -> u32 {
    22
}
fn default_schedule_path() -> PathBuf {
    PathBuf::from("schedule.json")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for FusionConfig {
    fn default() -> Self {
        FusionConfig {
            multioutput: true,
            ast_rewrite: false,
            fuse_arange: false,
            fuse_conv_bw: false,
            use_copy_kernel: false,
        }
    }
}

impl Default for SplitConfig {
    fn default() -> Self {
        SplitConfig {
            reduceop_split_threshold: default_split_threshold(),
            reduceop_split_size: default_split_size(),
        }
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        PersistConfig {
            save_schedule: false,
            save_schedule_path: default_schedule_path(),
            logops: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. scheduler.toml (base configuration)
    /// 2. scheduler.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (LAZYLAYER_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("scheduler.toml"))
            .merge(Toml::file("scheduler.local.toml"))
            .merge(Env::prefixed("LAZYLAYER_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("LAZYLAYER_").split("__"))
            .extract()
    }

    /// Install a global tracing subscriber honoring `logging.level` and
    /// `RUST_LOG`. Errors if a subscriber is already set.
    pub fn init_logging(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.logging.level.clone()));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        if self.logging.format == "json" {
            builder.json().try_init()?;
        } else {
            builder.try_init()?;
        }
        Ok(())
    }
}
