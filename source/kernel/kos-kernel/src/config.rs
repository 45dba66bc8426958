// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel configuration document (JSON) and its per-subsystem sections
//! INVARIANTS: Missing fields fall back to defaults; `validate` runs before any
//! subsystem is constructed from the document

use std::fs;
use std::path::{Path, PathBuf};

use kos_abi::time::NSEC_PER_MSEC;
use kos_diag::PanicConfig;
use kos_net::NetConfig;
use kos_vfs::VfsConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "KOS_CONFIG";

/// Errors produced while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid JSON or names an unknown variant.
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    /// A field holds a value no subsystem can run with.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Timer subsystem section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Length of one wheel slot.
    pub resolution_ns: u64,
    /// Number of wheel slots.
    pub wheel_slots: usize,
    /// Spawn the ticker thread at boot.
    pub autostart_ticker: bool,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self { resolution_ns: NSEC_PER_MSEC, wheel_slots: 256, autostart_ticker: true }
    }
}

/// IRQ-to-CPU balancing policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancePolicy {
    /// Leave assignments alone.
    #[default]
    None,
    /// Spread active IRQs over CPUs in IRQ order.
    RoundRobin,
    /// Busiest IRQs first onto the least loaded CPU.
    LoadBased,
    /// Load based, but only when the load is visibly skewed.
    Adaptive,
}

/// IRQ registry section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrqConfig {
    /// Balancer policy.
    pub balance_policy: BalancePolicy,
    /// Period of the balancer thread.
    pub balance_interval_ms: u64,
    /// CPUs interrupts may be routed to.
    pub nr_cpus: u32,
}

impl Default for IrqConfig {
    fn default() -> Self {
        Self { balance_policy: BalancePolicy::None, balance_interval_ms: 1000, nr_cpus: 1 }
    }
}

/// Scheduler section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedConfig {
    /// Ticks a thread may run before it is preempted.
    pub timeslice_ms: u64,
    /// Scheduler tick period.
    pub tick_ms: u64,
    /// Usable stack bytes per thread.
    pub stack_size: u64,
    /// Unmapped guard below each stack.
    pub guard_size: u64,
    /// Live thread limit.
    pub max_threads: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            timeslice_ms: 10,
            tick_ms: 1,
            stack_size: 64 * 1024,
            guard_size: 4096,
            max_threads: 4096,
        }
    }
}

/// Panic path section, converted into [`PanicConfig`] at boot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanicSection {
    /// Append-mode panic log.
    pub log_path: PathBuf,
    /// Directory receiving core dumps.
    pub core_dir: PathBuf,
    /// Emit the blink pattern before aborting.
    pub blink: bool,
}

impl Default for PanicSection {
    fn default() -> Self {
        let d = PanicConfig::default();
        Self { log_path: d.log_path, core_dir: d.core_dir, blink: d.blink }
    }
}

impl From<PanicSection> for PanicConfig {
    fn from(s: PanicSection) -> Self {
        PanicConfig { log_path: s.log_path, core_dir: s.core_dir, blink: s.blink }
    }
}

/// Whole kernel configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Timer subsystem.
    pub timer: TimerConfig,
    /// IRQ registry.
    pub irq: IrqConfig,
    /// Scheduler.
    pub sched: SchedConfig,
    /// Virtual filesystem.
    pub vfs: VfsConfig,
    /// Network stack.
    pub net: NetConfig,
    /// Panic path.
    pub panic: PanicSection,
}

impl KernelConfig {
    /// Parses and validates a JSON document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let cfg: KernelConfig = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads and validates the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let cfg = Self::from_json(&text)?;
        log::info!("config: loaded {}", path.display());
        Ok(cfg)
    }

    /// Loads the file named by `KOS_CONFIG`, or the defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(PathBuf::from(path)),
            None => {
                log::debug!("config: {} unset, using defaults", CONFIG_ENV);
                Ok(Self::default())
            }
        }
    }

    /// Pretty JSON rendering, suitable for `load`.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Rejects values no subsystem can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timer.resolution_ns == 0 {
            return Err(ConfigError::Invalid("timer.resolution_ns must be non-zero"));
        }
        if self.timer.wheel_slots == 0 {
            return Err(ConfigError::Invalid("timer.wheel_slots must be non-zero"));
        }
        if self.irq.nr_cpus == 0 {
            return Err(ConfigError::Invalid("irq.nr_cpus must be non-zero"));
        }
        if self.irq.balance_policy != BalancePolicy::None && self.irq.balance_interval_ms == 0 {
            return Err(ConfigError::Invalid("irq.balance_interval_ms must be non-zero"));
        }
        if self.sched.timeslice_ms == 0 || self.sched.tick_ms == 0 {
            return Err(ConfigError::Invalid("sched.timeslice_ms and sched.tick_ms must be non-zero"));
        }
        if self.sched.max_threads == 0 {
            return Err(ConfigError::Invalid("sched.max_threads must be non-zero"));
        }
        if self.vfs.max_fds == 0 || self.vfs.max_fds > kos_abi::MAX_FDS {
            return Err(ConfigError::Invalid("vfs.max_fds out of range"));
        }
        Ok(())
    }
}
