//! Virtualized system-call surface.
//!
//! A [`VirtualEnv`] describes everything a module observes through WASI apart
//! from its stdout and stderr sinks: arguments, environment variables, stdin,
//! clocks and entropy. It is an explicit value handed to instantiation, so no
//! two executions share mutable virtual state.
//!
//! Stdin is either a byte buffer or a caller-supplied stream. A stream is
//! only read when the module reads stdin, from inside the run future, so a
//! stream that never ends cannot hold up cancellation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::io::AsyncRead;
use wasmtime_wasi::pipe::{AsyncReadStream, MemoryInputPipe};
use wasmtime_wasi::{AsyncStdinStream, HostMonotonicClock, HostWallClock, WasiCtxBuilder};

use wasi_sandbox_common::{ClockMode, EntropyMode, EnvironmentConfig};

/// Advance of the deterministic clock on every read.
const DETERMINISTIC_STEP: Duration = Duration::from_micros(1);

/// Clock observed by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockSource {
    /// The WASI layer's own clocks.
    #[default]
    Engine,
    /// Starts at `start` (since the Unix epoch) and advances by a fixed step
    /// on every read, independent of real time.
    Deterministic {
        /// Wall-clock value of the first read.
        start: Duration,
    },
}

/// Entropy observed by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntropySource {
    /// The WASI layer's CSPRNG, seeded from the operating system.
    #[default]
    Os,
    /// A reproducible generator.
    Seeded(u64),
}

/// Where the module's stdin comes from.
enum StdinSource {
    Bytes(Vec<u8>),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

/// Arguments, environment, stdin, clock and entropy for one execution.
pub struct VirtualEnv {
    args: Vec<String>,
    vars: Vec<(String, String)>,
    stdin: StdinSource,
    clock: ClockSource,
    entropy: EntropySource,
}

impl VirtualEnv {
    /// An environment whose only argument is `name`, with empty stdin.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            args: vec![name.into()],
            vars: Vec::new(),
            stdin: StdinSource::Bytes(Vec::new()),
            clock: ClockSource::default(),
            entropy: EntropySource::default(),
        }
    }

    /// An environment for `name` configured from `config`.
    pub fn from_config(name: impl Into<String>, config: &EnvironmentConfig) -> Self {
        let clock = match config.clock {
            ClockMode::Engine => ClockSource::Engine,
            ClockMode::Deterministic => ClockSource::Deterministic {
                start: Duration::from_secs(config.clock_start_secs),
            },
        };
        let entropy = match config.entropy {
            EntropyMode::Os => EntropySource::Os,
            EntropyMode::Seeded => EntropySource::Seeded(config.seed),
        };

        let mut env = Self::new(name).with_clock(clock).with_entropy(entropy);
        env.vars = config
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env
    }

    /// Use `bytes` as the module's stdin.
    #[must_use]
    pub fn with_stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = StdinSource::Bytes(bytes.into());
        self
    }

    /// Feed the module's stdin from `reader`.
    ///
    /// The reader is pulled in the background as the module consumes what
    /// was already read, so at most one chunk is buffered ahead. A read
    /// error reaches the module as a failed `fd_read`.
    #[must_use]
    pub fn with_stdin_stream(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = StdinSource::Stream(Box::new(reader));
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.push((key.into(), value.into()));
        self
    }

    /// Set the clock source.
    #[must_use]
    pub fn with_clock(mut self, clock: ClockSource) -> Self {
        self.clock = clock;
        self
    }

    /// Set the entropy source.
    #[must_use]
    pub fn with_entropy(mut self, entropy: EntropySource) -> Self {
        self.entropy = entropy;
        self
    }

    /// Arguments passed to the module; the first is its name.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Environment variables passed to the module.
    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    /// Bytes the module will read from stdin, unless stdin is a stream.
    pub fn stdin_bytes(&self) -> Option<&[u8]> {
        match &self.stdin {
            StdinSource::Bytes(bytes) => Some(bytes.as_slice()),
            StdinSource::Stream(_) => None,
        }
    }

    /// Wire this environment into a WASI context builder.
    pub(crate) fn apply(self, builder: &mut WasiCtxBuilder) {
        builder
            .args(self.args.as_slice())
            .envs(self.vars.as_slice());

        match self.stdin {
            StdinSource::Bytes(bytes) => builder.stdin(MemoryInputPipe::new(bytes)),
            StdinSource::Stream(reader) => {
                builder.stdin(AsyncStdinStream::new(AsyncReadStream::new(reader)))
            }
        };

        if let ClockSource::Deterministic { start } = self.clock {
            builder
                .wall_clock(DeterministicWallClock::new(start))
                .monotonic_clock(DeterministicMonotonicClock::default());
        }

        if let EntropySource::Seeded(seed) = self.entropy {
            builder
                .secure_random(StdRng::seed_from_u64(seed))
                .insecure_random(StdRng::seed_from_u64(seed.rotate_left(32)))
                .insecure_random_seed(u128::from(seed));
        }
    }
}

impl std::fmt::Debug for VirtualEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stdin = match &self.stdin {
            StdinSource::Bytes(bytes) => format!("{} bytes", bytes.len()),
            StdinSource::Stream(_) => "stream".to_string(),
        };
        f.debug_struct("VirtualEnv")
            .field("args", &self.args)
            .field("vars", &self.vars)
            .field("stdin", &stdin)
            .field("clock", &self.clock)
            .field("entropy", &self.entropy)
            .finish()
    }
}

/// Wall clock that advances by [`DETERMINISTIC_STEP`] per read.
#[derive(Debug)]
struct DeterministicWallClock {
    start: Duration,
    reads: AtomicU64,
}

impl DeterministicWallClock {
    fn new(start: Duration) -> Self {
        Self {
            start,
            reads: AtomicU64::new(0),
        }
    }
}

impl HostWallClock for DeterministicWallClock {
    fn resolution(&self) -> Duration {
        DETERMINISTIC_STEP
    }

    fn now(&self) -> Duration {
        let reads = self.reads.fetch_add(1, Ordering::Relaxed);
        self.start + step_times(reads)
    }
}

/// Monotonic clock that starts at zero and advances by
/// [`DETERMINISTIC_STEP`] per read.
#[derive(Debug, Default)]
struct DeterministicMonotonicClock {
    reads: AtomicU64,
}

impl HostMonotonicClock for DeterministicMonotonicClock {
    fn resolution(&self) -> u64 {
        u64::try_from(DETERMINISTIC_STEP.as_nanos()).unwrap_or(u64::MAX)
    }

    fn now(&self) -> u64 {
        let reads = self.reads.fetch_add(1, Ordering::Relaxed);
        u64::try_from(step_times(reads).as_nanos()).unwrap_or(u64::MAX)
    }
}

fn step_times(reads: u64) -> Duration {
    DETERMINISTIC_STEP.saturating_mul(u32::try_from(reads).unwrap_or(u32::MAX))
}
