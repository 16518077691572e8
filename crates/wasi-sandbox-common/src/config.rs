//! Configuration structures for the wasi-sandbox.
//!
//! This module defines configuration options for various components:
//! - [`SandboxConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (allocation, interruption)
//! - [`ExecutionConfig`]: Per-execution limits (timeout, fuel, output capacity)
//! - [`EnvironmentConfig`]: Virtualized clock, entropy and environment variables

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level sandbox configuration.
///
/// This structure contains all configuration options for the sandbox.
/// It can be loaded from files (TOML, JSON).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SandboxConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Virtualized system-call surface configuration.
    #[serde(default)]
    pub environment: EnvironmentConfig,

    /// Compilation cache directory used when a request does not name one.
    #[serde(default)]
    pub cache_dir: Option<String>,
}

/// Wasmtime engine configuration.
///
/// A fresh engine is created for every execution, so these settings apply to
/// each execution independently.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable the pooling allocator.
    ///
    /// Memory is reserved up front for `max_instances` instances, so this is
    /// only worth it for modules that instantiate many times per engine.
    #[serde(default)]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Interval between epoch ticks in milliseconds.
    ///
    /// Running modules yield back to the executor once per tick, which bounds
    /// how long cancellation takes to be observed.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,

    /// Cranelift optimization level.
    #[serde(default)]
    pub opt_level: OptLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: false,
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
            opt_level: OptLevel::default(),
        }
    }
}

impl EngineConfig {
    /// Get the epoch tick interval as a `Duration`.
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms.max(1))
    }
}

/// Cranelift optimization level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    /// No optimizations.
    None,
    /// Optimize for speed.
    #[default]
    Speed,
    /// Optimize for speed and size.
    SpeedAndSize,
}

/// Per-execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Execution timeout in milliseconds. `0` disables the timeout.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Fuel (roughly, wasm instructions) per execution. `0` disables metering.
    #[serde(default)]
    pub max_fuel: u64,

    /// Maximum bytes captured from the module's stdout.
    #[serde(default = "defaults::stdout_capacity")]
    pub stdout_capacity: usize,

    /// Maximum bytes captured from the module's stderr.
    #[serde(default = "defaults::stderr_capacity")]
    pub stderr_capacity: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::timeout_ms(),
            max_fuel: 0,
            stdout_capacity: defaults::stdout_capacity(),
            stderr_capacity: defaults::stderr_capacity(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`, or `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Returns `true` if fuel metering is enabled.
    pub fn fuel_metering(&self) -> bool {
        self.max_fuel > 0
    }
}

/// Virtualized system-call surface configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EnvironmentConfig {
    /// Clock exposed to the module.
    #[serde(default)]
    pub clock: ClockMode,

    /// Wall-clock start, in seconds since the Unix epoch, for the
    /// deterministic clock.
    #[serde(default)]
    pub clock_start_secs: u64,

    /// Entropy exposed to the module.
    #[serde(default)]
    pub entropy: EntropyMode,

    /// Seed for the seeded entropy source.
    #[serde(default)]
    pub seed: u64,

    /// Environment variables visible to the module. Nothing from the host
    /// environment is passed through.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// Which clock the module observes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    /// The WASI layer's clocks, backed by the host.
    #[default]
    Engine,
    /// A virtual clock that advances by a fixed step on every read.
    Deterministic,
}

/// Which entropy source the module observes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntropyMode {
    /// The WASI layer's CSPRNG, seeded from the operating system.
    #[default]
    Os,
    /// A reproducible generator seeded from `EnvironmentConfig::seed`.
    Seeded,
}

/// Default value functions for serde.
mod defaults {
    pub const fn max_instances() -> u32 {
        16
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn epoch_tick_ms() -> u64 {
        5
    }

    pub const fn timeout_ms() -> u64 {
        30_000
    }

    pub const fn stdout_capacity() -> usize {
        16 * 1024 * 1024
    }

    pub const fn stderr_capacity() -> usize {
        1024 * 1024
    }
}
