use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{hlog_debug, Error, Result};

/// Top-level configuration, stored as `~/.hive/hive.toml`.
///
/// Every field has a default so a partial (or missing) file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub vcpu: VcpuConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub listen: String,
    pub cluster_epoch: u64,
    pub heartbeat_interval_ms: u64,
    pub missed_heartbeats: u32,
    pub lease_ms: u64,
    pub clock_skew_ms: u64,
    pub max_retries: u32,
    /// Tasks staged per node beyond its running capacity (stealable backlog).
    pub prefetch_depth: usize,
    pub tick_ms: u64,
    /// Final reports kept for finished submissions, oldest dropped first.
    pub retained_reports: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:6000".to_string(),
            cluster_epoch: 1,
            heartbeat_interval_ms: 500,
            missed_heartbeats: 3,
            lease_ms: 5_000,
            clock_skew_ms: 100,
            max_retries: 3,
            prefetch_depth: 2,
            tick_ms: 100,
            retained_reports: 1_024,
        }
    }
}

impl CoordinatorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence longer than this declares a node Lost.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.missed_heartbeats + self.clock_skew()
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::from_millis(self.clock_skew_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub coordinator: String,
    pub capacity: u32,
    /// Cycles a vCPU runs before yielding its worker slot.
    pub slice_cycles: u64,
    pub accelerator_timeout_ms: u64,
    pub reconnect_backoff_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            coordinator: "127.0.0.1:6000".to_string(),
            capacity: 4,
            slice_cycles: 10_000,
            accelerator_timeout_ms: 2_000,
            reconnect_backoff_ms: 500,
        }
    }
}

impl NodeConfig {
    pub fn accelerator_timeout(&self) -> Duration {
        Duration::from_millis(self.accelerator_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VcpuConfig {
    pub registers: usize,
    pub memory_words: usize,
    /// Total cycles a task may consume across all slices before it faults.
    pub cycle_budget: u64,
    pub max_program_len: usize,
}

impl Default for VcpuConfig {
    fn default() -> Self {
        Self {
            registers: 16,
            memory_words: 256,
            cycle_budget: 10_000_000,
            max_program_len: 65_536,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    pub max_frame_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn hive_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".hive"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("hive.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        hlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            hlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        hlog_debug!(
            "Config loaded: listen={} capacity={} registers={}",
            config.coordinator.listen,
            config.node.capacity,
            config.vcpu.registers
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        hlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.heartbeat_interval_ms == 0 {
            return Err(Error::Validation(
                "coordinator.heartbeat_interval_ms must be > 0".to_string(),
            ));
        }
        if self.coordinator.missed_heartbeats == 0 {
            return Err(Error::Validation(
                "coordinator.missed_heartbeats must be > 0".to_string(),
            ));
        }
        if self.coordinator.lease_ms == 0 {
            return Err(Error::Validation("coordinator.lease_ms must be > 0".to_string()));
        }
        if self.vcpu.registers == 0 || self.vcpu.registers > crate::vcpu::MAX_REGISTERS {
            return Err(Error::Validation(format!(
                "vcpu.registers must be in 1..={}",
                crate::vcpu::MAX_REGISTERS
            )));
        }
        if self.node.slice_cycles == 0 {
            return Err(Error::Validation("node.slice_cycles must be > 0".to_string()));
        }
        Ok(())
    }
}
