//! Error types for the wasi-sandbox.
//!
//! This module defines the error taxonomy using `thiserror`:
//! - [`ExecError`]: Everything a single execution can fail with
//! - [`CacheError`]: Compilation cache failures
//! - [`TeardownError`]: Failures while releasing an engine instance

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Text substituted for captured stderr when the module wrote nothing to it.
pub const NO_STDERR_PLACEHOLDER: &str = "(no output captured on stderr)";

/// Errors returned by a sandboxed execution.
///
/// Every variant keeps the underlying cause text intact. Variants that are
/// produced after the module started running also carry the captured stderr.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The compilation cache directory could not be opened or created.
    #[error("failed to instantiate compilation cache at {}: {source}", .path.display())]
    CacheInit {
        /// Directory that was requested.
        path: PathBuf,
        /// Why the directory is unusable.
        #[source]
        source: CacheError,
    },

    /// The engine instance could not be created or wired.
    #[error("failed to create engine instance: {reason}")]
    Engine {
        /// Description of the engine failure.
        reason: String,
    },

    /// The module bytes are invalid or were rejected by the engine.
    #[error("failed to compile module: {reason}")]
    Compile {
        /// Engine diagnostic.
        reason: String,
    },

    /// The module failed while being instantiated or run.
    #[error("failed to instantiate module: {reason}: stderr: {}", lossy(.stderr))]
    Instantiation {
        /// The trap or instantiation failure.
        reason: String,
        /// Exit code when the module called `proc_exit` with a non-zero status.
        exit_code: Option<i32>,
        /// Captured stderr bytes, or [`NO_STDERR_PLACEHOLDER`].
        stderr: Vec<u8>,
    },

    /// The execution was interrupted by its cancellation token or deadline.
    #[error("execution {cause}: stderr: {}", lossy(.stderr))]
    Cancelled {
        /// What interrupted the execution.
        cause: CancelCause,
        /// Captured stderr bytes, or [`NO_STDERR_PLACEHOLDER`].
        stderr: Vec<u8>,
    },

    /// Releasing the engine instance failed.
    ///
    /// `primary` holds the execution error that happened before teardown, if
    /// any. Both causes are part of the message.
    #[error("{}", teardown_message(.source, .primary))]
    Teardown {
        /// The teardown failure.
        #[source]
        source: TeardownError,
        /// The error the execution had already produced.
        primary: Option<Box<ExecError>>,
    },
}

/// What interrupted a cancelled execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// The caller triggered its cancellation token.
    Cancelled,
    /// The configured execution timeout elapsed.
    DeadlineExceeded {
        /// The timeout in milliseconds.
        timeout_ms: u64,
    },
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::Cancelled => write!(f, "cancelled"),
            CancelCause::DeadlineExceeded { timeout_ms } => {
                write!(f, "timed out after {timeout_ms}ms")
            }
        }
    }
}

/// Compilation cache failures.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The cache path exists but is not a directory.
    #[error("path is not a directory")]
    NotADirectory,

    /// A compiled module could not be serialized for storage.
    #[error("failed to serialize compiled module: {reason}")]
    Serialize {
        /// Engine diagnostic.
        reason: String,
    },

    /// Filesystem access to the cache failed.
    #[error("{operation}: {source}")]
    Io {
        /// The operation that failed.
        operation: &'static str,
        /// The I/O failure.
        #[source]
        source: io::Error,
    },
}

/// Failure while releasing an engine instance.
#[derive(Error, Debug)]
#[error("failed to release {resource}: {reason}")]
pub struct TeardownError {
    /// The resource that could not be released.
    pub resource: &'static str,
    /// Description of the failure.
    pub reason: String,
}

#[allow(clippy::ref_option)]
fn teardown_message(source: &TeardownError, primary: &Option<Box<ExecError>>) -> String {
    match primary {
        Some(primary) => format!("{primary}; additionally {source}"),
        None => source.to_string(),
    }
}

impl ExecError {
    /// Create a new `CacheInit` error.
    pub fn cache_init(path: impl Into<PathBuf>, source: CacheError) -> Self {
        Self::CacheInit {
            path: path.into(),
            source,
        }
    }

    /// Create a new `Engine` error.
    pub fn engine(reason: impl Into<String>) -> Self {
        Self::Engine {
            reason: reason.into(),
        }
    }

    /// Create a new `Compile` error.
    pub fn compile(reason: impl Into<String>) -> Self {
        Self::Compile {
            reason: reason.into(),
        }
    }

    /// Create a new `Instantiation` error, substituting the placeholder for
    /// empty stderr.
    pub fn instantiation(
        reason: impl Into<String>,
        exit_code: Option<i32>,
        stderr: impl Into<Vec<u8>>,
    ) -> Self {
        Self::Instantiation {
            reason: reason.into(),
            exit_code,
            stderr: or_placeholder(stderr.into()),
        }
    }

    /// Create a new `Cancelled` error, substituting the placeholder for empty
    /// stderr.
    pub fn cancelled(cause: CancelCause, stderr: impl Into<Vec<u8>>) -> Self {
        Self::Cancelled {
            cause,
            stderr: or_placeholder(stderr.into()),
        }
    }

    /// Returns `true` if the execution was interrupted by cancellation or its
    /// deadline.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::Teardown {
                primary: Some(primary),
                ..
            } => primary.is_cancelled(),
            _ => false,
        }
    }

    /// Returns `true` if this error (or the primary error behind a teardown
    /// failure) came from compiling the module.
    pub fn is_compile(&self) -> bool {
        match self {
            Self::Compile { .. } => true,
            Self::Teardown {
                primary: Some(primary),
                ..
            } => primary.is_compile(),
            _ => false,
        }
    }

    /// The stderr bytes captured before the failure, if the module got to
    /// run. Nothing is decoded; invalid UTF-8 is kept as written.
    pub fn captured_stderr(&self) -> Option<&[u8]> {
        match self {
            Self::Instantiation { stderr, .. } | Self::Cancelled { stderr, .. } => {
                Some(stderr.as_slice())
            }
            Self::Teardown {
                primary: Some(primary),
                ..
            } => primary.captured_stderr(),
            _ => None,
        }
    }
}

/// Combine an execution result with the outcome of tearing down its engine.
///
/// A teardown failure is never dropped: it wraps the primary error when there
/// is one, and turns a success into a failure when there is not.
pub fn with_teardown<T>(
    result: Result<T, ExecError>,
    teardown: Result<(), TeardownError>,
) -> Result<T, ExecError> {
    match (result, teardown) {
        (result, Ok(())) => result,
        (Ok(_), Err(source)) => Err(ExecError::Teardown {
            source,
            primary: None,
        }),
        (Err(primary), Err(source)) => Err(ExecError::Teardown {
            source,
            primary: Some(Box::new(primary)),
        }),
    }
}

fn or_placeholder(stderr: Vec<u8>) -> Vec<u8> {
    if stderr.is_empty() {
        NO_STDERR_PLACEHOLDER.as_bytes().to_vec()
    } else {
        stderr
    }
}

fn lossy(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker_failure() -> TeardownError {
        TeardownError {
            resource: "epoch ticker",
            reason: "thread panicked".into(),
        }
    }

    #[test]
    fn test_error_display() {
        let err = ExecError::compile("magic header not detected");
        assert_eq!(
            err.to_string(),
            "failed to compile module: magic header not detected"
        );

        let err = ExecError::cache_init("/nope", CacheError::NotADirectory);
        assert_eq!(
            err.to_string(),
            "failed to instantiate compilation cache at /nope: path is not a directory"
        );
    }

    #[test]
    fn test_instantiation_placeholder() {
        let err = ExecError::instantiation("wasm trap: unreachable", None, "");
        assert_eq!(err.captured_stderr(), Some(NO_STDERR_PLACEHOLDER.as_bytes()));
        assert!(err.to_string().ends_with("stderr: (no output captured on stderr)"));

        let err = ExecError::instantiation("wasm trap: unreachable", None, "boom\n");
        assert_eq!(err.captured_stderr(), Some(b"boom\n".as_slice()));
    }

    #[test]
    fn test_stderr_kept_byte_for_byte() {
        let written = b"\xff\xfe oops\n".to_vec();
        let err = ExecError::instantiation("wasm trap: unreachable", None, written.clone());

        assert_eq!(err.captured_stderr(), Some(written.as_slice()));
        assert!(err.to_string().ends_with("stderr: \u{fffd}\u{fffd} oops\n"), "{err}");

        let err = ExecError::cancelled(CancelCause::Cancelled, written.clone());
        assert_eq!(err.captured_stderr(), Some(written.as_slice()));
    }

    #[test]
    fn test_cancel_cause_display() {
        assert_eq!(CancelCause::Cancelled.to_string(), "cancelled");
        assert_eq!(
            CancelCause::DeadlineExceeded { timeout_ms: 250 }.to_string(),
            "timed out after 250ms"
        );

        let err = ExecError::cancelled(CancelCause::Cancelled, "");
        assert!(err.is_cancelled());
        assert_eq!(err.captured_stderr(), Some(NO_STDERR_PLACEHOLDER.as_bytes()));
    }

    #[test]
    fn test_with_teardown_success_passes_through() {
        let result = with_teardown(Ok::<_, ExecError>(7), Ok(()));
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_with_teardown_failure_after_success() {
        let err = with_teardown(Ok::<_, ExecError>(()), Err(ticker_failure())).unwrap_err();

        assert!(matches!(err, ExecError::Teardown { primary: None, .. }));
        assert_eq!(
            err.to_string(),
            "failed to release epoch ticker: thread panicked"
        );
    }

    #[test]
    fn test_with_teardown_keeps_both_causes() {
        let primary = ExecError::instantiation("wasm trap", Some(3), "oops");
        let err = with_teardown(Err::<(), _>(primary), Err(ticker_failure())).unwrap_err();

        let message = err.to_string();
        assert!(message.contains("wasm trap"), "{message}");
        assert!(message.contains("oops"), "{message}");
        assert!(message.contains("thread panicked"), "{message}");
        assert_eq!(err.captured_stderr(), Some(b"oops".as_slice()));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_predicates_see_through_teardown() {
        let primary = ExecError::cancelled(CancelCause::Cancelled, "");
        let err = with_teardown(Err::<(), _>(primary), Err(ticker_failure())).unwrap_err();
        assert!(err.is_cancelled());
        assert!(!err.is_compile());

        let err =
            with_teardown(Err::<(), _>(ExecError::compile("bad")), Err(ticker_failure()))
                .unwrap_err();
        assert!(err.is_compile());
    }

    #[test]
    fn test_primary_error_kept_without_teardown_failure() {
        let err = with_teardown(Err::<(), _>(ExecError::compile("bad")), Ok(())).unwrap_err();
        assert!(matches!(err, ExecError::Compile { .. }));
    }
}
