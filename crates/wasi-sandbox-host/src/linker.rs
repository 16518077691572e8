//! WASI registration for Wasmtime linkers.
//!
//! Every module runs against the standard WASI preview-1 surface (args,
//! environment, clocks, random, stdio, filesystem calls) and nothing else.
//! What those calls observe is decided per execution by the store's
//! [`VirtualEnv`](wasi_sandbox_core::VirtualEnv); the linker only binds the
//! imports.

use tracing::debug;
use wasmtime::Linker;
use wasmtime_wasi::preview1;

use wasi_sandbox_common::ExecError;
use wasi_sandbox_core::SandboxContext;

/// Module name of the WASI preview-1 imports.
pub const PREVIEW1_MODULE: &str = "wasi_snapshot_preview1";

/// Register the WASI preview-1 system-call surface on a core module linker.
///
/// This must happen before any module is instantiated on the linker.
///
/// # Errors
///
/// Returns [`ExecError::Engine`] if registration fails, e.g. because the
/// surface is already registered.
pub fn register_preview1(linker: &mut Linker<SandboxContext>) -> Result<(), ExecError> {
    preview1::add_to_linker_async(linker, SandboxContext::wasi_mut).map_err(|e| {
        ExecError::engine(format!("failed to register {PREVIEW1_MODULE}: {e:#}"))
    })?;

    debug!(module = PREVIEW1_MODULE, "WASI surface registered");
    Ok(())
}
