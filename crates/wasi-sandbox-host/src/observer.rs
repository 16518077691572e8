//! Execution lifecycle hooks.
//!
//! A [`Sandbox`](crate::Sandbox) reports the milestones of every execution to
//! an [`ExecutionObserver`]. Hooks run synchronously on the executing task and
//! must not block.

use std::sync::atomic::{AtomicU64, Ordering};

use wasi_sandbox_common::TeardownError;
use wasi_sandbox_core::{CompileOrigin, CompiledModule};

/// Receives lifecycle events of sandboxed executions.
///
/// Every method has a no-op default, so implementors only override what they
/// care about.
pub trait ExecutionObserver: Send + Sync {
    /// An engine instance was created for `execution_id`.
    fn on_engine_created(&self, execution_id: &str) {
        let _ = execution_id;
    }

    /// The module of `execution_id` is compiled and ready to instantiate.
    fn on_compiled(&self, execution_id: &str, module: &CompiledModule) {
        let _ = (execution_id, module);
    }

    /// The engine instance of `execution_id` was closed.
    ///
    /// Called exactly once for every engine instance that was created, also
    /// when the execution future is dropped before it finishes.
    fn on_teardown(&self, execution_id: &str, result: Result<(), &TeardownError>) {
        let _ = (execution_id, result);
    }
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}

/// Observer that counts events.
#[derive(Debug, Default)]
pub struct CountingObserver {
    engines_created: AtomicU64,
    native_compiles: AtomicU64,
    cache_hits: AtomicU64,
    teardowns: AtomicU64,
    teardown_failures: AtomicU64,
}

/// A point-in-time copy of a [`CountingObserver`]'s counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObservedCounts {
    /// Engine instances created.
    pub engines_created: u64,
    /// Modules compiled to native code, with or without a cache.
    pub native_compiles: u64,
    /// Modules loaded from a cached artifact.
    pub cache_hits: u64,
    /// Engine instances closed.
    pub teardowns: u64,
    /// Engine instances whose close failed.
    pub teardown_failures: u64,
}

impl CountingObserver {
    /// Create an observer with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter values.
    pub fn counts(&self) -> ObservedCounts {
        ObservedCounts {
            engines_created: self.engines_created.load(Ordering::Relaxed),
            native_compiles: self.native_compiles.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            teardowns: self.teardowns.load(Ordering::Relaxed),
            teardown_failures: self.teardown_failures.load(Ordering::Relaxed),
        }
    }
}

impl ExecutionObserver for CountingObserver {
    fn on_engine_created(&self, _execution_id: &str) {
        self.engines_created.fetch_add(1, Ordering::Relaxed);
    }

    fn on_compiled(&self, _execution_id: &str, module: &CompiledModule) {
        match module.origin() {
            CompileOrigin::CacheHit => self.cache_hits.fetch_add(1, Ordering::Relaxed),
            CompileOrigin::Uncached | CompileOrigin::CacheMiss => {
                self.native_compiles.fetch_add(1, Ordering::Relaxed)
            }
        };
    }

    fn on_teardown(&self, _execution_id: &str, result: Result<(), &TeardownError>) {
        self.teardowns.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            self.teardown_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}
