//! Orchestrator configuration
//!
//! Loaded from YAML (or JSON, by extension), then overridden from the
//! environment, then validated. A missing file at the default location
//! means "all defaults".

pub mod inventory;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use inventory::{Inventory, IpRange};

pub const DEFAULT_GC_INTERVAL_SECS: u64 = 600;
pub const DEFAULT_GC_WAIT_SECS: u64 = 600;
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_VRRP_HANDOVER_DELAY_MS: u64 = 10_000;
pub const DEFAULT_GC_LOCK_WAIT_SECS: u64 = 3;
pub const DEFAULT_GUEST_DOMAIN_SUFFIX: &str = "cloud.internal";
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MAX_NICS_PER_VM: u32 = 24;

/// Default config file location: ~/.netorch/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".netorch")
        .join("config.yaml")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse {0}: {1}")]
    ParseError(PathBuf, String),

    #[error("Invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Tunables of the orchestrator and its GC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Seconds between GC sweeps
    pub gc_interval_secs: u64,
    /// Seconds a network must stay free between two observations
    pub gc_wait_secs: u64,
    /// Bounded wait for the per-network row lock
    pub lock_timeout_secs: u64,
    pub rolling_restart: bool,
    /// Grace period before destroying the old primary of a redundant pair
    pub vrrp_handover_delay_ms: u64,
    /// Bounded wait for the cluster-wide GC lock; a busy lock skips the pass
    pub gc_lock_wait_secs: u64,
    /// Network domain suffix when the zone has none
    pub guest_domain_suffix: String,
    pub agent_timeout_secs: u64,
    /// Ceiling on the NIC slots a single VM may request
    pub max_nics_per_vm: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gc_interval_secs: DEFAULT_GC_INTERVAL_SECS,
            gc_wait_secs: DEFAULT_GC_WAIT_SECS,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            rolling_restart: true,
            vrrp_handover_delay_ms: DEFAULT_VRRP_HANDOVER_DELAY_MS,
            gc_lock_wait_secs: DEFAULT_GC_LOCK_WAIT_SECS,
            guest_domain_suffix: DEFAULT_GUEST_DOMAIN_SUFFIX.to_string(),
            agent_timeout_secs: DEFAULT_AGENT_TIMEOUT_SECS,
            max_nics_per_vm: DEFAULT_MAX_NICS_PER_VM,
        }
    }
}

impl OrchestratorConfig {
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn gc_wait(&self) -> Duration {
        Duration::from_secs(self.gc_wait_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn vrrp_handover_delay(&self) -> Duration {
        Duration::from_millis(self.vrrp_handover_delay_ms)
    }

    pub fn gc_lock_wait(&self) -> Duration {
        Duration::from_secs(self.gc_lock_wait_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    /// Apply `NETORCH_*` overrides; `lookup` is `std::env::var` outside tests
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_override(&lookup, "NETORCH_GC_INTERVAL")? {
            self.gc_interval_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "NETORCH_GC_WAIT")? {
            self.gc_wait_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "NETORCH_LOCK_TIMEOUT")? {
            self.lock_timeout_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "NETORCH_ROLLING_RESTART")? {
            self.rolling_restart = v;
        }
        if let Some(v) = parse_override(&lookup, "NETORCH_VRRP_DELAY_MS")? {
            self.vrrp_handover_delay_ms = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("gc_interval_secs", self.gc_interval_secs),
            ("gc_wait_secs", self.gc_wait_secs),
            ("lock_timeout_secs", self.lock_timeout_secs),
            ("gc_lock_wait_secs", self.gc_lock_wait_secs),
            ("agent_timeout_secs", self.agent_timeout_secs),
            ("max_nics_per_vm", u64::from(self.max_nics_per_vm)),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", key)));
            }
        }
        if self.guest_domain_suffix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "guest_domain_suffix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_override<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
    }
}

// ============================================================================
// SBIO: Pure parsing (no I/O)
// ============================================================================

/// Parse YAML or JSON depending on the file extension
pub fn parse_document<T: DeserializeOwned>(path: &Path, content: &str) -> Result<T, ConfigError> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        serde_json::from_str(content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    } else {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Expand `~` and environment references in a user-supplied path
pub fn expand_path(path: &str) -> Result<PathBuf, ConfigError> {
    shellexpand::full(path)
        .map(|p| PathBuf::from(p.as_ref()))
        .map_err(|e| ConfigError::Invalid(format!("cannot expand {}: {}", path, e)))
}

/// Load a config file, apply process environment overrides and validate
///
/// With no explicit path a missing default file yields the defaults; an
/// explicit path that does not exist is an error.
pub fn load_config(path: Option<&str>) -> Result<OrchestratorConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let path = expand_path(path)?;
            if !path.exists() {
                return Err(ConfigError::NotFound(path));
            }
            read_document(&path)?
        }
        None => {
            let path = default_config_path();
            if path.exists() {
                read_document(&path)?
            } else {
                debug!("No config at {}, using defaults", path.display());
                OrchestratorConfig::default()
            }
        }
    };

    config.apply_overrides(|var| std::env::var(var).ok())?;
    config.validate()?;
    Ok(config)
}

/// Read and parse a YAML/JSON document from disk
pub fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_document(path, &content)
}
