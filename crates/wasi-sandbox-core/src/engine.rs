//! Engine instance creation and teardown.
//!
//! An [`EngineInstance`] owns everything one execution allocates inside
//! Wasmtime:
//! - The [`Engine`] and its compilation settings
//! - The [`Linker`] the WASI surface is registered on
//! - An epoch ticker thread that lets running modules be interrupted
//!
//! It is created per execution and must be released with
//! [`EngineInstance::close`], which reports failures instead of hiding them.

use std::hash::{Hash, Hasher};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, Linker, PoolingAllocationConfig};

use crate::store::SandboxContext;
use wasi_sandbox_common::{EngineConfig, ExecError, ExecutionConfig, OptLevel, TeardownError};

/// Exclusively owned engine for a single execution.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Async Support**: Execution is driven as a future so it can be raced
///   against cancellation
/// - **Epoch Interruption**: A background ticker advances the epoch so that
///   long-running guest code yields back to the executor
/// - **Fuel Metering**: Enabled only when the execution config sets a budget
/// - **Pooling Allocator**: Optional
///
/// Dropping an instance without calling [`close`](Self::close) still stops the
/// ticker, but any failure is only logged.
pub struct EngineInstance {
    engine: Engine,
    linker: Linker<SandboxContext>,
    fingerprint: String,
    ticker: Option<EpochTicker>,
}

impl EngineInstance {
    /// Create a new engine instance.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Engine`] if:
    /// - The Wasmtime configuration is invalid
    /// - The pooling allocator cannot be initialized
    /// - The epoch ticker thread cannot be spawned
    pub fn new(config: &EngineConfig, execution: &ExecutionConfig) -> Result<Self, ExecError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.async_support(true);
        wasmtime_config.epoch_interruption(true);
        wasmtime_config.consume_fuel(execution.fuel_metering());
        wasmtime_config.cranelift_opt_level(match config.opt_level {
            OptLevel::None => wasmtime::OptLevel::None,
            OptLevel::Speed => wasmtime::OptLevel::Speed,
            OptLevel::SpeedAndSize => wasmtime::OptLevel::SpeedAndSize,
        });

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            debug!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config)
            .map_err(|e| ExecError::engine(format!("invalid Wasmtime configuration: {e:#}")))?;

        let fingerprint = engine_fingerprint(&engine);
        let ticker = EpochTicker::spawn(engine.clone(), config.epoch_tick())?;
        let linker = Linker::new(&engine);

        info!(
            fingerprint = %fingerprint,
            fuel_metering = execution.fuel_metering(),
            "Engine instance created"
        );

        Ok(Self {
            engine,
            linker,
            fingerprint,
            ticker: Some(ticker),
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_component_instances(config.max_instances);
        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the linker modules are instantiated through.
    pub fn linker(&self) -> &Linker<SandboxContext> {
        &self.linker
    }

    /// Get a mutable reference to the linker.
    ///
    /// Use this to register the WASI surface before instantiating anything.
    pub fn linker_mut(&mut self) -> &mut Linker<SandboxContext> {
        &mut self.linker
    }

    /// Fingerprint of the Wasmtime version and every setting that affects
    /// compiled code. Artifacts are only interchangeable between engines with
    /// equal fingerprints.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Release the engine and everything it owns.
    ///
    /// # Errors
    ///
    /// Returns a [`TeardownError`] if the epoch ticker thread panicked.
    pub fn close(mut self) -> Result<(), TeardownError> {
        self.release()
    }

    /// Stop the epoch ticker in place.
    ///
    /// Only the first call does any work; later calls return `Ok(())`. For
    /// owners that cannot give up the instance by value, such as a drop
    /// guard.
    ///
    /// # Errors
    ///
    /// Returns a [`TeardownError`] if the epoch ticker thread panicked.
    pub fn release(&mut self) -> Result<(), TeardownError> {
        let Some(ticker) = self.ticker.take() else {
            return Ok(());
        };

        let result = ticker.stop();
        debug!(fingerprint = %self.fingerprint, ok = result.is_ok(), "Engine instance closed");
        result
    }
}

impl Drop for EngineInstance {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            if let Err(e) = ticker.stop() {
                warn!(error = %e, "Engine instance dropped without close");
            }
        }
    }
}

impl std::fmt::Debug for EngineInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineInstance")
            .field("fingerprint", &self.fingerprint)
            .field("ticking", &self.ticker.is_some())
            .finish_non_exhaustive()
    }
}

/// Background thread that advances the engine epoch at a fixed interval.
struct EpochTicker {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl EpochTicker {
    fn spawn(engine: Engine, tick: Duration) -> Result<Self, ExecError> {
        let (stop, stopped) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("epoch-ticker".into())
            .spawn(move || {
                // Dropping the sender disconnects the channel and ends the loop.
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(tick) {
                    engine.increment_epoch();
                }
            })
            .map_err(|e| ExecError::engine(format!("failed to spawn epoch ticker: {e}")))?;

        Ok(Self { stop, handle })
    }

    fn stop(self) -> Result<(), TeardownError> {
        drop(self.stop);
        self.handle.join().map_err(|panic| TeardownError {
            resource: "epoch ticker",
            reason: panic_message(panic.as_ref()),
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "thread panicked".to_string()
    }
}

/// Length of the fingerprint digest prefix, in bytes.
const FINGERPRINT_BYTES: usize = 8;

/// Hash the engine's precompile compatibility key with SHA-256 and keep the
/// first [`FINGERPRINT_BYTES`] bytes, hex encoded.
///
/// The digest does not depend on the toolchain, so cache directories named
/// after it survive a compiler upgrade.
fn engine_fingerprint(engine: &Engine) -> String {
    let mut hasher = Sha256Hasher::default();
    engine.precompile_compatibility_hash().hash(&mut hasher);
    let digest = hasher.0.finalize();
    hex::encode(&digest[..FINGERPRINT_BYTES])
}

/// Feeds [`Hash`] input into a SHA-256 digest.
#[derive(Default)]
struct Sha256Hasher(Sha256);

impl Hasher for Sha256Hasher {
    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finish(&self) -> u64 {
        let digest = self.0.clone().finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }
}
