//! etude server binary.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::{Parser, ValueEnum};
use etude_core::config::{LogFormat, TickSource};
use etude_core::{Config, MemoryBackend, Reactor, ResourcePool, logging, signal};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "Event-driven HTTP/1.1 server with a worker pool and idle eviction")]
#[command(version)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(long, short)]
    port: Option<u16>,

    /// Worker threads (0 = one per CPU)
    #[arg(long, short)]
    threads: Option<usize>,

    /// Backend connections opened at startup
    #[arg(long)]
    pool_size: Option<usize>,

    /// Directory static files are served from
    #[arg(long)]
    doc_root: Option<PathBuf>,

    /// Log filter, e.g. `info` or `etude_core=debug`
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, value_enum)]
    log_format: Option<Format>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Pretty,
    Compact,
    Json,
}

impl From<Format> for LogFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Pretty => LogFormat::Pretty,
            Format::Compact => LogFormat::Compact,
            Format::Json => LogFormat::Json,
        }
    }
}

fn load_config(args: &Args) -> Result<Config, etude_core::config::ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(threads) = args.threads {
        config.workers.threads = threads;
    }
    if let Some(pool_size) = args.pool_size {
        config.backend.pool_size = pool_size;
    }
    if let Some(doc_root) = &args.doc_root {
        config.doc_root = doc_root.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = args.log_format {
        config.logging.format = format.into();
    }
    config.validate()?;
    Ok(config)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(&config) {
        Ok(()) => {
            logging::flush();
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "server error");
            logging::flush();
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let pool = Arc::new(ResourcePool::initialize(
        MemoryBackend::new(),
        &config.backend,
        config.backend.pool_size,
    )?);

    let mut reactor = Reactor::bind(config, pool.clone())?;
    signal::install(&reactor.notifier())?;
    tracing::info!(
        addr = %reactor.local_addr(),
        workers = config.worker_threads(),
        pool_size = config.backend.pool_size,
        ticks = match config.timer.tick_source {
            TickSource::Alarm => "alarm",
            TickSource::Thread => "thread",
        },
        "etude started"
    );

    let result = reactor.run();
    drop(reactor);
    pool.shutdown();
    result?;
    tracing::info!("etude shut down");
    Ok(())
}
