//! wasi-sandbox CLI entry point.
//!
//! Runs a single WASI preview-1 module in the sandbox and writes whatever it
//! printed on stdout to a file or to the terminal.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use wasi_sandbox_common::{ConfigFile, LogFormat, LoggingConfig};
use wasi_sandbox_host::{ExecutionRequest, Sandbox};

const DEFAULT_FILTER: &str = "info,wasi_sandbox=debug";

#[derive(Debug, Parser)]
#[command(name = "wasi-sandbox", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a module and capture its stdout.
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Path to the WebAssembly module.
    module: PathBuf,

    /// Name passed to the module as its only argument [default: file stem].
    #[arg(long)]
    name: Option<String>,

    /// File to feed to the module's stdin.
    #[arg(long, conflicts_with = "input")]
    stdin: Option<PathBuf>,

    /// Literal text to feed to the module's stdin.
    #[arg(long)]
    input: Option<String>,

    /// Directory for compiled artifacts.
    #[arg(long, env = "WASI_SANDBOX_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Write stdout here instead of to the terminal.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(short, long, env = "WASI_SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Abort the module after this many milliseconds (0 disables).
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut file = match &args.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConfigFile::default(),
    };

    init_tracing(&file.logging);

    if let Some(timeout_ms) = args.timeout_ms {
        file.sandbox.execution.timeout_ms = timeout_ms;
    }

    let wasm = std::fs::read(&args.module)
        .with_context(|| format!("Failed to read module {}", args.module.display()))?;
    let name = args.name.clone().unwrap_or_else(|| module_name(&args.module));

    let mut request = ExecutionRequest::new(name, wasm).with_stdin(stdin_reader(&args).await?);
    if let Some(dir) = &args.cache_dir {
        request = request.with_cache_dir(dir);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling execution");
            on_interrupt.cancel();
        }
    });

    let sandbox = Sandbox::new(file.sandbox);
    let start = Instant::now();

    let report = sandbox
        .execute_report(request, &cancel)
        .await
        .with_context(|| format!("Failed to run {}", args.module.display()))?;

    match &args.output {
        Some(path) => std::fs::write(path, &report.stdout)
            .with_context(|| format!("Failed to write output to {}", path.display()))?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(&report.stdout)
                .and_then(|()| stdout.flush())
                .context("Failed to write output")?;
        }
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        engine = %report.engine_fingerprint,
        origin = %report.origin,
        bytes = report.stdout.len(),
        compile_ms = report.compile_time.as_millis(),
        elapsed_ms = start.elapsed().as_millis(),
        "Module finished"
    );

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(logging.filter.as_deref().unwrap_or(DEFAULT_FILTER))
    });
    let registry = tracing_subscriber::registry().with(filter);

    // Module stdout may go to the terminal, so diagnostics stay on stderr.
    match logging.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

async fn stdin_reader(args: &RunArgs) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>> {
    if let Some(path) = &args.stdin {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open stdin file {}", path.display()))?;
        return Ok(Box::new(file));
    }

    let input = args.input.clone().unwrap_or_default();
    Ok(Box::new(Cursor::new(input.into_bytes())))
}

fn module_name(path: &Path) -> String {
    path.file_stem()
        .map_or_else(|| "module".to_string(), |stem| stem.to_string_lossy().into_owned())
}
