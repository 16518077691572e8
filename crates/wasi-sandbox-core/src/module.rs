//! WebAssembly module compilation.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's
//! [`Module`] that records where the compiled code came from:
//!
//! - **Uncached**: compiled from the Wasm bytes, no cache involved
//! - **Cache miss**: compiled, then stored in the [`CompilationCache`]
//! - **Cache hit**: deserialized from the [`CompilationCache`]

use std::fmt;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{info, instrument};
use wasmtime::{Engine, Module};

use crate::cache::CompilationCache;
use crate::engine::EngineInstance;
use wasi_sandbox_common::ExecError;

/// How a [`CompiledModule`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileOrigin {
    /// Compiled natively with no cache configured.
    Uncached,
    /// Compiled natively and written to the cache.
    CacheMiss,
    /// Loaded from the cache without native compilation.
    CacheHit,
}

impl CompileOrigin {
    /// Returns `true` if native compilation ran.
    pub fn compiled_natively(self) -> bool {
        !matches!(self, CompileOrigin::CacheHit)
    }
}

impl fmt::Display for CompileOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileOrigin::Uncached => write!(f, "uncached"),
            CompileOrigin::CacheMiss => write!(f, "cache-miss"),
            CompileOrigin::CacheHit => write!(f, "cache-hit"),
        }
    }
}

/// A compiled WebAssembly module.
///
/// Cheap to clone; the underlying Wasmtime module is reference counted.
#[derive(Clone)]
pub struct CompiledModule {
    inner: Module,

    /// SHA-256 of the original Wasm bytes, hex encoded.
    content_hash: String,

    origin: CompileOrigin,

    /// Time spent compiling or loading.
    duration: Duration,
}

impl CompiledModule {
    /// Compile a core module from WebAssembly bytes, going through `cache`
    /// when one is given.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Compile`] if the bytes are not a valid module.
    #[instrument(skip(engine, bytes, cache), fields(bytes_len = bytes.len()))]
    pub fn compile(
        engine: &EngineInstance,
        bytes: &[u8],
        cache: Option<&CompilationCache>,
    ) -> Result<Self, ExecError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;
        let content_hash = compute_hash(bytes);

        let (inner, origin) = match cache {
            Some(cache) => cache.load_or_compile(engine, &content_hash, || {
                compile_native(engine.inner(), bytes)
            })?,
            None => (compile_native(engine.inner(), bytes)?, CompileOrigin::Uncached),
        };

        let duration = start.elapsed();

        info!(
            content_hash = %content_hash,
            origin = %origin,
            duration_ms = duration.as_millis(),
            "Module ready"
        );

        Ok(Self {
            inner,
            content_hash,
            origin,
            duration,
        })
    }

    /// Get the content hash of the original Wasm bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// How this module was obtained.
    pub fn origin(&self) -> CompileOrigin {
        self.origin
    }

    /// Time spent compiling or loading the module.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.inner
    }

    /// Validate WebAssembly header (magic number and version).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), ExecError> {
        if bytes.len() < 8 {
            return Err(ExecError::compile("invalid Wasm: file too small"));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(ExecError::compile("invalid Wasm: bad magic number"));
        }

        Ok(())
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

fn compile_native(engine: &Engine, bytes: &[u8]) -> Result<Module, ExecError> {
    Module::from_binary(engine, bytes).map_err(|e| ExecError::compile(format!("{e:#}")))
}

/// SHA-256 of the given bytes, hex encoded.
fn compute_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
