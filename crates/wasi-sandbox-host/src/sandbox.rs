//! The engine host.
//!
//! [`Sandbox::execute`] runs one WebAssembly module to completion inside a
//! fresh engine instance:
//!
//! 1. Open (or reuse) the compilation cache for the request's directory
//! 2. Create the engine instance and register the WASI surface
//! 3. Compile, through the cache when one is configured
//! 4. Instantiate against the virtual environment and run `_start`
//! 5. Close the engine instance, whatever happened before
//!
//! Cancellation and the configured deadline interrupt step 4 and surface as
//! [`ExecError::Cancelled`]. The deadline cancels a child of the caller's
//! token, so both arrive through the same signal and the caller's token is
//! never fired by the sandbox.
//!
//! Step 5 runs even when the caller drops the future mid-execution: the
//! engine instance sits in a guard that closes it and notifies the observer
//! on drop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{Span, debug, info, instrument, warn};
use uuid::Uuid;

use wasi_sandbox_common::{CancelCause, ExecError, SandboxConfig, TeardownError, with_teardown};
use wasi_sandbox_core::{
    CacheStats, CompilationCache, CompileOrigin, EngineInstance, ModuleRunner, RunOutcome,
    StdioCapture, VirtualEnv,
};

use crate::linker::register_preview1;
use crate::observer::{ExecutionObserver, NoopObserver};

/// One module execution requested by a caller.
pub struct ExecutionRequest {
    name: String,
    wasm: Vec<u8>,
    stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    cache_dir: Option<PathBuf>,
}

impl ExecutionRequest {
    /// Run `wasm` under `name`, which becomes the module's only argument.
    ///
    /// Stdin is empty and no cache directory is set. The bytes are not
    /// validated until compilation.
    pub fn new(name: impl Into<String>, wasm: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            wasm: wasm.into(),
            stdin: None,
            cache_dir: None,
        }
    }

    /// Feed `reader` to the module's stdin.
    ///
    /// The reader is only pulled while the module reads stdin. A reader that
    /// never reaches end of input does not keep the execution alive past its
    /// cancellation or deadline.
    #[must_use]
    pub fn with_stdin(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(reader));
        self
    }

    /// Cache compiled artifacts under `dir`. An empty path disables caching.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.cache_dir = (!dir.as_os_str().is_empty()).then_some(dir);
        self
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Module bytes.
    pub fn wasm(&self) -> &[u8] {
        &self.wasm
    }

    /// Requested cache directory, if any.
    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }
}

impl std::fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("name", &self.name)
            .field("wasm_len", &self.wasm.len())
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

/// Everything a successful execution produced.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Identifier used in logs and observer events.
    pub execution_id: String,
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
    /// How the module was obtained.
    pub origin: CompileOrigin,
    /// SHA-256 of the module bytes, hex encoded.
    pub content_hash: String,
    /// Compatibility fingerprint of the engine (version and settings).
    pub engine_fingerprint: String,
    /// Fuel consumed, when metering is enabled.
    pub fuel_consumed: Option<u64>,
    /// Time spent compiling or loading the module.
    pub compile_time: Duration,
    /// Wall time of the whole execution, teardown included.
    pub elapsed: Duration,
}

/// Runs WebAssembly modules in isolated engine instances.
///
/// A `Sandbox` is cheap to share behind an [`Arc`]; concurrent executions
/// each get their own engine instance, store and stdio sinks, and share only
/// the compilation cache of a directory.
pub struct Sandbox {
    config: SandboxConfig,
    caches: DashMap<PathBuf, Arc<CompilationCache>>,
    observer: Arc<dyn ExecutionObserver>,
}

impl Sandbox {
    /// Create a sandbox with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            caches: DashMap::new(),
            observer: Arc::new(NoopObserver),
        }
    }

    /// Report lifecycle events to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// The sandbox configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The cache opened for `dir`, if an execution has used it.
    pub fn cache(&self, dir: &Path) -> Option<Arc<CompilationCache>> {
        self.caches.get(dir).map(|entry| Arc::clone(entry.value()))
    }

    /// Counters of the cache opened for `dir`, if any.
    pub fn cache_stats(&self, dir: &Path) -> Option<CacheStats> {
        self.cache(dir).map(|cache| cache.stats())
    }

    /// Run a module and return its stdout.
    ///
    /// # Errors
    ///
    /// See [`ExecError`]. Run failures carry the module's stderr, and a
    /// failure to release the engine instance is merged into the result.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ExecError> {
        self.execute_report(request, cancel)
            .await
            .map(|report| report.stdout)
    }

    /// Run a module and return everything it produced.
    ///
    /// # Errors
    ///
    /// Same as [`Sandbox::execute`].
    #[instrument(
        name = "execute",
        skip_all,
        fields(module = %request.name, execution_id = tracing::field::Empty)
    )]
    pub async fn execute_report(
        &self,
        request: ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, ExecError> {
        let execution_id = Uuid::new_v4().to_string();
        Span::current().record("execution_id", execution_id.as_str());
        let start = Instant::now();

        let ExecutionRequest {
            name,
            wasm,
            stdin,
            cache_dir,
        } = request;

        let cache = self.open_cache(cache_dir.as_deref())?;

        let engine = EngineInstance::new(&self.config.engine, &self.config.execution)?;
        self.observer.on_engine_created(&execution_id);
        let mut guard = EngineGuard {
            engine,
            execution_id: &execution_id,
            observer: self.observer.as_ref(),
            closed: false,
        };

        let result = self
            .run(
                &mut guard.engine,
                &execution_id,
                &name,
                &wasm,
                stdin,
                cache.as_deref(),
                cancel,
            )
            .await;

        let teardown = guard.close();

        let result = with_teardown(result, teardown).map(|mut report| {
            report.elapsed = start.elapsed();
            report
        });

        match &result {
            Ok(report) => info!(
                origin = %report.origin,
                stdout_bytes = report.stdout.len(),
                elapsed_ms = report.elapsed.as_millis(),
                "Execution succeeded"
            ),
            Err(e) => warn!(error = %e, "Execution failed"),
        }

        result
    }

    /// Everything between engine creation and teardown.
    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        engine: &mut EngineInstance,
        execution_id: &str,
        name: &str,
        wasm: &[u8],
        stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
        cache: Option<&CompilationCache>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, ExecError> {
        register_preview1(engine.linker_mut())?;
        let engine = &*engine;

        let compiled = ModuleRunner::new(engine, execution_id).compile(wasm, cache)?;
        let origin = compiled.module().origin();
        let content_hash = compiled.module().content_hash().to_string();
        let compile_time = compiled.module().duration();
        self.observer.on_compiled(execution_id, compiled.module());

        let env = VirtualEnv::from_config(name, &self.config.environment);
        let env = match stdin {
            Some(reader) => env.with_stdin_stream(reader),
            None => env,
        };
        let execution = &self.config.execution;
        let capture = StdioCapture::new(execution);

        let token = cancel.child_token();
        let _deadline = execution.timeout().map(|timeout| {
            let token = token.clone();
            AbortOnDropHandle::new(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            }))
        });

        let outcome = tokio::select! {
            biased;

            () = token.cancelled() => {
                let cause = if cancel.is_cancelled() {
                    debug!("Execution cancelled");
                    CancelCause::Cancelled
                } else {
                    debug!(timeout_ms = execution.timeout_ms, "Execution deadline exceeded");
                    CancelCause::DeadlineExceeded { timeout_ms: execution.timeout_ms }
                };
                return Err(ExecError::cancelled(cause, capture.stderr()));
            }
            outcome = async {
                let runner = compiled.instantiate(env, execution, &capture).await?;
                Ok::<_, ExecError>(runner.run().await)
            } => outcome?,
        };

        match outcome {
            RunOutcome::Completed {
                stdout,
                stderr,
                fuel_consumed,
            } => Ok(ExecutionReport {
                execution_id: execution_id.to_string(),
                stdout,
                stderr,
                origin,
                content_hash,
                engine_fingerprint: engine.fingerprint().to_string(),
                fuel_consumed,
                compile_time,
                elapsed: Duration::ZERO,
            }),
            RunOutcome::Trapped { error } => Err(error),
        }
    }

    /// Resolve the cache directory of a request and open it once per
    /// sandbox.
    fn open_cache(&self, dir: Option<&Path>) -> Result<Option<Arc<CompilationCache>>, ExecError> {
        let dir = match dir {
            Some(dir) => dir.to_path_buf(),
            None => match self.config.cache_dir.as_deref() {
                Some(dir) if !dir.is_empty() => PathBuf::from(dir),
                _ => return Ok(None),
            },
        };

        if let Some(cache) = self.cache(&dir) {
            return Ok(Some(cache));
        }

        let cache = CompilationCache::open(&dir).map_err(|e| ExecError::cache_init(&dir, e))?;
        let cache = self
            .caches
            .entry(dir)
            .or_insert_with(|| Arc::new(cache))
            .value()
            .clone();

        Ok(Some(cache))
    }
}

/// Owns the engine instance of one execution.
///
/// Closing it, or dropping it when the execution future is abandoned,
/// releases the engine and reports the teardown to the observer. Either way
/// that happens once.
struct EngineGuard<'a> {
    engine: EngineInstance,
    execution_id: &'a str,
    observer: &'a dyn ExecutionObserver,
    closed: bool,
}

impl EngineGuard<'_> {
    fn close(mut self) -> Result<(), TeardownError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), TeardownError> {
        self.closed = true;
        let result = self.engine.release();
        self.observer
            .on_teardown(self.execution_id, result.as_ref().copied());
        result
    }
}

impl Drop for EngineGuard<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        debug!(execution_id = self.execution_id, "Execution abandoned, closing engine");
        if let Err(e) = self.release() {
            warn!(error = %e, "Engine teardown failed after the execution was abandoned");
        }
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("config", &self.config)
            .field("caches", &self.caches.len())
            .finish_non_exhaustive()
    }
}
