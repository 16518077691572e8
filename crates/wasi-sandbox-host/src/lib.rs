//! Engine host for wasi-sandbox.
//!
//! This crate turns the core pipeline into a single call: a [`Sandbox`] takes
//! an [`ExecutionRequest`] and returns the module's stdout or a structured
//! [`ExecError`](wasi_sandbox_common::ExecError).
//!
//! # Modules
//!
//! - [`sandbox`]: The engine host, its cache registry and cancellation
//! - [`linker`]: WASI preview-1 registration
//! - [`observer`]: Lifecycle hooks for compile origin and teardown
//!
//! # Guarantees
//!
//! 1. **Isolation**: Every execution gets its own engine instance, store and
//!    stdio sinks. Only the compilation cache of a directory is shared.
//! 2. **Teardown**: Every engine instance that was created is closed exactly
//!    once, and a close failure is never silently dropped.
//! 3. **Cancellation**: A fired token or an elapsed deadline interrupts the
//!    running module and is reported as `Cancelled`, never as success.

pub mod linker;
pub mod observer;
pub mod sandbox;

pub use linker::register_preview1;
pub use observer::{CountingObserver, ExecutionObserver, NoopObserver, ObservedCounts};
pub use sandbox::{ExecutionReport, ExecutionRequest, Sandbox};
