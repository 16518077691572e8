//! Core Wasmtime execution pipeline for wasi-sandbox.
//!
//! This crate provides the building blocks of one sandboxed execution:
//! - [`EngineInstance`]: Per-execution engine with guaranteed teardown
//! - [`CompilationCache`]: Persistent, concurrency-safe compiled-module store
//! - [`CompiledModule`]: Compiled WebAssembly module wrapper
//! - [`VirtualEnv`]: Args, env, stdin, clock and entropy seen by the module
//! - [`ModuleRunner`]: Compile → instantiate → run state machine
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  CompilationCache                       │
//! │  (Shared across executions, one per directory)          │
//! │  - <engine fingerprint>/<sha256>.cwasm                  │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   EngineInstance                        │
//! │  (Per execution, closed exactly once)                   │
//! │  - Engine + WASI linker                                 │
//! │  - Epoch ticker thread                                  │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │         Store<SandboxContext> + StdioCapture            │
//! │  (Per execution, isolated)                              │
//! │  - Virtual args/env/stdin/clock/entropy                 │
//! │  - In-memory stdout and stderr                          │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod engine;
pub mod env;
pub mod instance;
pub mod module;
pub mod store;

pub use cache::{CacheStats, CompilationCache};
pub use engine::EngineInstance;
pub use env::{ClockSource, EntropySource, VirtualEnv};
pub use instance::{Compiled, Created, Instantiated, ModuleRunner, RunOutcome};
pub use module::{CompileOrigin, CompiledModule};
pub use store::{SandboxContext, SinkOverflow, StdioCapture};
