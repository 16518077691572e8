//! Module execution state machine.
//!
//! [`ModuleRunner`] walks one execution through
//! `Created → Compiled → Instantiated → {Completed | Trapped}`. Each
//! transition consumes the runner, so no state can be skipped or revisited:
//!
//! 1. [`compile`](ModuleRunner::compile) validates and compiles the bytes
//! 2. [`instantiate`](ModuleRunner::instantiate) links the module against the
//!    WASI surface with a fresh store
//! 3. [`run`](ModuleRunner::run) drives `_start` to completion and reports a
//!    [`RunOutcome`]

use std::time::Instant;

use tracing::{debug, info, instrument, warn};
use wasmtime::{Instance, Store, Trap};
use wasmtime_wasi::I32Exit;

use crate::cache::CompilationCache;
use crate::engine::EngineInstance;
use crate::env::VirtualEnv;
use crate::module::CompiledModule;
use crate::store::{
    SandboxContext, StdioCapture, calculate_fuel_consumed, create_store, get_remaining_fuel,
};
use wasi_sandbox_common::{ExecError, ExecutionConfig};

/// WASI command entry point.
pub const ENTRY_POINT: &str = "_start";

/// Nothing has happened yet.
#[derive(Debug)]
pub struct Created;

/// The module is compiled and ready to instantiate.
#[derive(Debug)]
pub struct Compiled {
    module: CompiledModule,
}

/// The module is instantiated against its virtual environment.
pub struct Instantiated {
    store: Store<SandboxContext>,
    instance: Instance,
    capture: StdioCapture,
}

/// Drives one execution through its states.
pub struct ModuleRunner<'e, S> {
    engine: &'e EngineInstance,
    execution_id: String,
    state: S,
}

/// Terminal state of an execution.
#[derive(Debug)]
pub enum RunOutcome {
    /// `_start` returned, or the module exited with status 0.
    Completed {
        /// Everything written to stdout.
        stdout: Vec<u8>,
        /// Everything written to stderr.
        stderr: Vec<u8>,
        /// Fuel consumed, when metering is enabled.
        fuel_consumed: Option<u64>,
    },

    /// The module trapped, exited with a non-zero status or wrote past an
    /// output sink's capacity.
    Trapped {
        /// The failure, carrying captured stderr.
        error: ExecError,
    },
}

impl RunOutcome {
    /// Returns `true` if the execution completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }

    /// Returns `true` if the execution trapped.
    pub fn is_trapped(&self) -> bool {
        matches!(self, RunOutcome::Trapped { .. })
    }

    /// Captured stdout on completion, the failure otherwise.
    pub fn into_stdout(self) -> Result<Vec<u8>, ExecError> {
        match self {
            RunOutcome::Completed { stdout, .. } => Ok(stdout),
            RunOutcome::Trapped { error } => Err(error),
        }
    }
}

impl<'e> ModuleRunner<'e, Created> {
    /// Start a new execution on `engine`.
    ///
    /// The engine's linker must already carry the WASI surface.
    pub fn new(engine: &'e EngineInstance, execution_id: impl Into<String>) -> Self {
        Self {
            engine,
            execution_id: execution_id.into(),
            state: Created,
        }
    }

    /// Compile the module, through `cache` when given.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Compile`] if the bytes are not a valid module.
    pub fn compile(
        self,
        bytes: &[u8],
        cache: Option<&CompilationCache>,
    ) -> Result<ModuleRunner<'e, Compiled>, ExecError> {
        let module = CompiledModule::compile(self.engine, bytes, cache)?;

        Ok(ModuleRunner {
            engine: self.engine,
            execution_id: self.execution_id,
            state: Compiled { module },
        })
    }
}

impl<'e> ModuleRunner<'e, Compiled> {
    /// The compiled module.
    pub fn module(&self) -> &CompiledModule {
        &self.state.module
    }

    /// Instantiate the module with a fresh store wired to `env` and `capture`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Instantiation`] with captured stderr if linking
    /// fails or the module's start section traps.
    #[instrument(skip_all, fields(execution_id = %self.execution_id))]
    pub async fn instantiate(
        self,
        env: VirtualEnv,
        config: &ExecutionConfig,
        capture: &StdioCapture,
    ) -> Result<ModuleRunner<'e, Instantiated>, ExecError> {
        let mut store = create_store(
            self.engine,
            config,
            env,
            capture,
            self.execution_id.clone(),
        )?;

        debug!("Instantiating module");

        let instance = self
            .engine
            .linker()
            .instantiate_async(&mut store, self.state.module.inner())
            .await
            .map_err(|e| failure(&e, capture))?;

        Ok(ModuleRunner {
            engine: self.engine,
            execution_id: self.execution_id,
            state: Instantiated {
                store,
                instance,
                capture: capture.clone(),
            },
        })
    }
}

impl ModuleRunner<'_, Instantiated> {
    /// Run the module's `_start` entry point to completion.
    ///
    /// A module without `_start` completes immediately after instantiation.
    #[instrument(skip_all, fields(execution_id = %self.execution_id))]
    pub async fn run(self) -> RunOutcome {
        let Instantiated {
            mut store,
            instance,
            capture,
        } = self.state;

        let start = Instant::now();
        let initial_fuel = get_remaining_fuel(&store);

        let result = match instance.get_func(&mut store, ENTRY_POINT) {
            Some(func) => match func.typed::<(), ()>(&store) {
                Ok(func) => func.call_async(&mut store, ()).await,
                Err(e) => Err(e.context(format!("`{ENTRY_POINT}` has the wrong signature"))),
            },
            None => {
                debug!("Module has no `{ENTRY_POINT}` export");
                Ok(())
            }
        };

        let fuel_consumed = initial_fuel.map(|fuel| calculate_fuel_consumed(fuel, &store));
        let duration = start.elapsed();

        let result = match result {
            Err(e) if e.downcast_ref::<I32Exit>().is_some_and(|exit| exit.0 == 0) => Ok(()),
            other => other,
        };

        match result {
            Ok(()) => match capture.overflow() {
                Some(overflow) => {
                    let error =
                        ExecError::instantiation(overflow.to_string(), None, capture.stderr());
                    warn!(
                        duration_ms = duration.as_millis(),
                        error = %error,
                        "Execution overflowed its output"
                    );
                    RunOutcome::Trapped { error }
                }
                None => {
                    info!(
                        duration_ms = duration.as_millis(),
                        fuel_consumed,
                        "Execution completed successfully"
                    );
                    RunOutcome::Completed {
                        stdout: capture.stdout(),
                        stderr: capture.stderr(),
                        fuel_consumed,
                    }
                }
            },
            Err(e) => {
                let error = failure(&e, &capture);
                warn!(
                    duration_ms = duration.as_millis(),
                    fuel_consumed,
                    trap_code = ?e.downcast_ref::<Trap>(),
                    error = %error,
                    "Execution trapped"
                );
                RunOutcome::Trapped { error }
            }
        }
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for ModuleRunner<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRunner")
            .field("execution_id", &self.execution_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Instantiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instantiated")
            .field("capture", &self.capture)
            .finish_non_exhaustive()
    }
}

/// Turn a Wasmtime error into an [`ExecError::Instantiation`] carrying
/// whatever the module wrote to stderr.
fn failure(error: &wasmtime::Error, capture: &StdioCapture) -> ExecError {
    let stderr = capture.stderr();

    if let Some(exit) = error.downcast_ref::<I32Exit>() {
        return ExecError::instantiation(
            format!("module exited with status {}", exit.0),
            Some(exit.0),
            stderr,
        );
    }

    if is_out_of_fuel(error) {
        return ExecError::instantiation(format!("fuel exhausted: {error:#}"), None, stderr);
    }

    ExecError::instantiation(format!("{error:#}"), None, stderr)
}

/// Check if an error is due to fuel exhaustion.
fn is_out_of_fuel(error: &wasmtime::Error) -> bool {
    error
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
}
