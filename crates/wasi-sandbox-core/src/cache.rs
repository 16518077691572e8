//! Persistent compilation cache.
//!
//! Compiled artifacts are stored as
//! `<root>/<engine fingerprint>/<module sha256>.cwasm`. Entries are keyed by
//! both the module content and the engine that produced them, and are never
//! invalidated by the cache itself.
//!
//! Within a process, compile-and-store is serialized per key so concurrent
//! executions of the same module compile it once. Across processes, artifacts
//! are written to a temporary file and renamed into place, so readers never
//! observe a partially written entry.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use wasmtime::Module;

use crate::engine::EngineInstance;
use crate::module::CompileOrigin;
use wasi_sandbox_common::{CacheError, ExecError};

const ARTIFACT_EXTENSION: &str = "cwasm";

/// Directory-backed store of compiled modules.
///
/// A single `CompilationCache` is meant to be shared (behind an [`Arc`]) by
/// every execution that uses the same directory.
#[derive(Debug)]
pub struct CompilationCache {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    discarded: AtomicU64,
}

/// Counters describing how a cache has been used since it was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from a stored artifact.
    pub hits: u64,
    /// Lookups that required native compilation.
    pub misses: u64,
    /// Artifacts written to disk.
    pub stores: u64,
    /// Stored artifacts that could not be loaded and were removed.
    pub discarded: u64,
}

impl CompilationCache {
    /// Open the cache rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the path exists but is not a directory, cannot be
    /// created, or is not writable.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = dir.as_ref().to_path_buf();

        match fs::metadata(&root) {
            Ok(meta) if !meta.is_dir() => return Err(CacheError::NotADirectory),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&root).map_err(|source| CacheError::Io {
                    operation: "create cache directory",
                    source,
                })?;
            }
            Err(source) => {
                return Err(CacheError::Io {
                    operation: "inspect cache directory",
                    source,
                });
            }
        }

        // Fail now rather than on the first store.
        tempfile::Builder::new()
            .prefix(".writable")
            .tempfile_in(&root)
            .map_err(|source| CacheError::Io {
                operation: "write to cache directory",
                source,
            })?;

        info!(root = %root.display(), "Compilation cache opened");

        Ok(Self {
            root,
            locks: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        })
    }

    /// The directory this cache is rooted at.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of the usage counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    /// Path of the artifact for a module compiled by a given engine.
    pub fn artifact_path(&self, engine_fingerprint: &str, content_hash: &str) -> PathBuf {
        self.root
            .join(engine_fingerprint)
            .join(format!("{content_hash}.{ARTIFACT_EXTENSION}"))
    }

    /// Load the module from the cache, or compile and store it.
    ///
    /// `compile` runs at most once, and only when no usable artifact exists.
    /// Failing to store a fresh artifact is logged and otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns whatever `compile` returns.
    pub fn load_or_compile<F>(
        &self,
        engine: &EngineInstance,
        content_hash: &str,
        compile: F,
    ) -> Result<(Module, CompileOrigin), ExecError>
    where
        F: FnOnce() -> Result<Module, ExecError>,
    {
        let path = self.artifact_path(engine.fingerprint(), content_hash);
        let key = path.to_string_lossy().into_owned();
        let lock = self.key_lock(&key);

        let result = {
            let _guard = lock.lock();
            self.load_or_compile_locked(engine, &path, compile)
        };

        self.release_key_lock(&key, lock);
        result
    }

    fn load_or_compile_locked<F>(
        &self,
        engine: &EngineInstance,
        path: &Path,
        compile: F,
    ) -> Result<(Module, CompileOrigin), ExecError>
    where
        F: FnOnce() -> Result<Module, ExecError>,
    {
        if path.is_file() {
            if let Some(module) = self.load(engine, path) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok((module, CompileOrigin::CacheHit));
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let module = compile()?;

        match store_artifact(path, &module) {
            Ok(()) => {
                self.stores.fetch_add(1, Ordering::Relaxed);
                debug!(path = %path.display(), "Compiled artifact stored");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to store compiled artifact"),
        }

        Ok((module, CompileOrigin::CacheMiss))
    }

    #[allow(unsafe_code)]
    fn load(&self, engine: &EngineInstance, path: &Path) -> Option<Module> {
        // SAFETY: files under this root are only written by `store_artifact`
        // from `Module::serialize`, and the fingerprint directory pins them to
        // a compatible engine. Wasmtime still validates the artifact header.
        match unsafe { Module::deserialize_file(engine.inner(), path) } {
            Ok(module) => {
                debug!(path = %path.display(), "Compiled artifact loaded");
                Some(module)
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %format!("{e:#}"),
                    "Discarding unusable cached artifact"
                );
                self.discarded.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove cached artifact");
                }
                None
            }
        }
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }

    /// Drop the lock entry of `key` unless another caller still holds it.
    fn release_key_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        // The map owns the last reference once every caller has released
        // theirs; `remove_if` checks it under the shard lock, which
        // `key_lock` needs to hand out a new clone.
        self.locks
            .remove_if(key, |_, entry| Arc::strong_count(entry) == 1);
    }
}

/// Write an artifact atomically: temp file in the same directory, then rename.
fn store_artifact(path: &Path, module: &Module) -> Result<(), CacheError> {
    let bytes = module.serialize().map_err(|e| CacheError::Serialize {
        reason: format!("{e:#}"),
    })?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|source| CacheError::Io {
        operation: "create artifact directory",
        source,
    })?;

    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|source| CacheError::Io {
        operation: "create temporary artifact",
        source,
    })?;
    file.write_all(&bytes)
        .and_then(|()| file.as_file().sync_all())
        .map_err(|source| CacheError::Io {
            operation: "write artifact",
            source,
        })?;
    file.persist(path).map_err(|e| CacheError::Io {
        operation: "persist artifact",
        source: e.error,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasi_sandbox_common::{EngineConfig, ExecutionConfig};

    const MINIMAL_WASM: &[u8] = &[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

    fn engine() -> EngineInstance {
        EngineInstance::new(&EngineConfig::default(), &ExecutionConfig::default()).unwrap()
    }

    fn compile(engine: &EngineInstance) -> Result<Module, ExecError> {
        Module::from_binary(engine.inner(), MINIMAL_WASM)
            .map_err(|e| ExecError::compile(e.to_string()))
    }

    #[test]
    fn test_open_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("nested").join("cache");

        let cache = CompilationCache::open(&root).unwrap();

        assert!(root.is_dir());
        assert_eq!(cache.root(), root);
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_open_rejects_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("occupied");
        fs::write(&file, b"not a directory").unwrap();

        let err = CompilationCache::open(&file).unwrap_err();
        assert!(matches!(err, CacheError::NotADirectory));
    }

    #[test]
    fn test_open_rejects_path_under_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("occupied");
        fs::write(&file, b"not a directory").unwrap();

        let err = CompilationCache::open(file.join("cache")).unwrap_err();
        assert!(matches!(err, CacheError::Io { .. }));
    }

    #[test]
    fn test_open_leaves_no_scratch_file_behind() {
        let tmp = tempfile::tempdir().unwrap();
        CompilationCache::open(tmp.path()).unwrap();

        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_miss_then_hit() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(tmp.path()).unwrap();
        let engine = engine();

        let (_, origin) = cache
            .load_or_compile(&engine, "abc", || compile(&engine))
            .unwrap();
        assert_eq!(origin, CompileOrigin::CacheMiss);
        assert!(cache.artifact_path(engine.fingerprint(), "abc").is_file());

        let (_, origin) = cache
            .load_or_compile(&engine, "abc", || panic!("must not recompile"))
            .unwrap();
        assert_eq!(origin, CompileOrigin::CacheHit);

        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                stores: 1,
                discarded: 0,
            }
        );
    }

    #[test]
    fn test_key_locks_are_released() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(tmp.path()).unwrap();
        let engine = engine();

        for key in ["abc", "def", "abc"] {
            cache
                .load_or_compile(&engine, key, || compile(&engine))
                .unwrap();
        }
        cache
            .load_or_compile(&engine, "bad", || Err(ExecError::compile("rejected")))
            .unwrap_err();

        assert!(cache.locks.is_empty());
    }

    #[test]
    fn test_key_locks_released_after_concurrent_use() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(tmp.path()).unwrap();
        let engine = engine();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    cache
                        .load_or_compile(&engine, "abc", || compile(&engine))
                        .unwrap();
                });
            }
        });

        assert!(cache.locks.is_empty());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hits, 3);
    }

    #[test]
    fn test_hit_across_engine_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(tmp.path()).unwrap();

        let first = engine();
        cache
            .load_or_compile(&first, "abc", || compile(&first))
            .unwrap();
        first.close().unwrap();

        let second = engine();
        let (_, origin) = cache
            .load_or_compile(&second, "abc", || compile(&second))
            .unwrap();
        assert_eq!(origin, CompileOrigin::CacheHit);
    }

    #[test]
    fn test_corrupt_artifact_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(tmp.path()).unwrap();
        let engine = engine();

        let path = cache.artifact_path(engine.fingerprint(), "abc");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"garbage").unwrap();

        let (_, origin) = cache
            .load_or_compile(&engine, "abc", || compile(&engine))
            .unwrap();

        assert_eq!(origin, CompileOrigin::CacheMiss);
        assert_eq!(cache.stats().discarded, 1);
        assert_eq!(cache.stats().stores, 1);
    }

    #[test]
    fn test_compile_error_is_not_stored() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(tmp.path()).unwrap();
        let engine = engine();

        let err = cache
            .load_or_compile(&engine, "bad", || Err(ExecError::compile("rejected")))
            .unwrap_err();

        assert!(err.is_compile());
        assert!(!cache.artifact_path(engine.fingerprint(), "bad").exists());
        assert_eq!(cache.stats().stores, 0);
    }
}
