//! Per-execution context and store management.
//!
//! This module provides:
//! - [`SandboxContext`]: Per-execution state owned by the Wasmtime store
//! - [`StdioCapture`]: The in-memory stdout/stderr sinks of one execution
//! - [`create_store`]: Builds a store wired to a [`VirtualEnv`]

use wasmtime::{Store, UpdateDeadline};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::pipe::MemoryOutputPipe;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::engine::EngineInstance;
use crate::env::VirtualEnv;
use wasi_sandbox_common::{ExecError, ExecutionConfig};

/// Per-execution context.
///
/// Holds the WASI preview-1 context the module's system calls are served
/// from. Created for each execution and dropped with its store.
pub struct SandboxContext {
    /// WASI preview-1 context.
    wasi: WasiP1Ctx,

    /// Execution identifier for tracing.
    pub execution_id: String,
}

impl SandboxContext {
    /// Create a context around an already built WASI context.
    pub fn new(wasi: WasiP1Ctx, execution_id: String) -> Self {
        Self { wasi, execution_id }
    }

    /// Access the WASI context, as required by the preview-1 linker bindings.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }
}

/// In-memory stdout and stderr sinks for one execution.
///
/// Clones share the same buffers, so a clone kept by the caller can read
/// whatever the module wrote even after the store has been dropped.
///
/// Each pipe holds one byte more than its configured capacity. A module that
/// writes past the limit leaves that extra byte behind, which is how
/// [`StdioCapture::overflow`] tells an exactly full sink from an overflowing
/// one. Once the pipe is full further writes fail inside the module.
#[derive(Clone)]
pub struct StdioCapture {
    stdout: MemoryOutputPipe,
    stderr: MemoryOutputPipe,
    stdout_capacity: usize,
    stderr_capacity: usize,
}

/// A sink that received more bytes than it may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkOverflow {
    /// `"stdout"` or `"stderr"`.
    pub stream: &'static str,
    /// The configured capacity in bytes.
    pub capacity: usize,
}

impl std::fmt::Display for SinkOverflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} capacity of {} bytes exceeded", self.stream, self.capacity)
    }
}

impl StdioCapture {
    /// Create empty sinks bounded by the configured capacities.
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            stdout: MemoryOutputPipe::new(config.stdout_capacity.saturating_add(1)),
            stderr: MemoryOutputPipe::new(config.stderr_capacity.saturating_add(1)),
            stdout_capacity: config.stdout_capacity,
            stderr_capacity: config.stderr_capacity,
        }
    }

    /// Everything written to stdout so far, up to its capacity.
    pub fn stdout(&self) -> Vec<u8> {
        bounded(&self.stdout, self.stdout_capacity)
    }

    /// Everything written to stderr so far, up to its capacity.
    pub fn stderr(&self) -> Vec<u8> {
        bounded(&self.stderr, self.stderr_capacity)
    }

    /// The first sink, stdout before stderr, that was written past its
    /// capacity.
    pub fn overflow(&self) -> Option<SinkOverflow> {
        if self.stdout.contents().len() > self.stdout_capacity {
            return Some(SinkOverflow {
                stream: "stdout",
                capacity: self.stdout_capacity,
            });
        }
        if self.stderr.contents().len() > self.stderr_capacity {
            return Some(SinkOverflow {
                stream: "stderr",
                capacity: self.stderr_capacity,
            });
        }
        None
    }
}

fn bounded(pipe: &MemoryOutputPipe, capacity: usize) -> Vec<u8> {
    let contents = pipe.contents();
    contents[..contents.len().min(capacity)].to_vec()
}

impl std::fmt::Debug for StdioCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioCapture")
            .field("stdout_len", &self.stdout.contents().len())
            .field("stdout_capacity", &self.stdout_capacity)
            .field("stderr_len", &self.stderr.contents().len())
            .field("stderr_capacity", &self.stderr_capacity)
            .finish()
    }
}

/// Create a new Wasmtime store for one execution.
///
/// The store's WASI context gets its args, env, stdin, clock and entropy from
/// `env`, and its stdout/stderr from `capture`. Guest code yields to the
/// executor on every epoch tick so that cancellation can be observed.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &EngineInstance,
    config: &ExecutionConfig,
    env: VirtualEnv,
    capture: &StdioCapture,
    execution_id: String,
) -> Result<Store<SandboxContext>, ExecError> {
    let mut builder = WasiCtxBuilder::new();
    env.apply(&mut builder);
    builder
        .stdout(capture.stdout.clone())
        .stderr(capture.stderr.clone());

    let context = SandboxContext::new(builder.build_p1(), execution_id);
    let mut store = Store::new(engine.inner(), context);

    if config.fuel_metering() {
        store
            .set_fuel(config.max_fuel)
            .map_err(|e| ExecError::engine(format!("failed to set fuel: {e:#}")))?;
    }

    store.set_epoch_deadline(1);
    store.epoch_deadline_callback(|_| Ok(UpdateDeadline::Yield(1)));

    Ok(store)
}

/// Get remaining fuel from a store.
pub(crate) fn get_remaining_fuel(store: &Store<SandboxContext>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Calculate fuel consumed.
pub fn calculate_fuel_consumed(initial_fuel: u64, store: &Store<SandboxContext>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}
