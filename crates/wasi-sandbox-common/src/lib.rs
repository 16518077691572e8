//! Common types, errors, and configuration for wasi-sandbox.
//!
//! This crate provides shared functionality used across the wasi-sandbox workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for engine, execution and environment settings
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{
    ClockMode, EngineConfig, EntropyMode, EnvironmentConfig, ExecutionConfig, OptLevel,
    SandboxConfig,
};
pub use config_file::{ConfigFile, ConfigFileError, LogFormat, LoggingConfig};
pub use error::{
    CacheError, CancelCause, ExecError, NO_STDERR_PLACEHOLDER, TeardownError, with_teardown,
};
