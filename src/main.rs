//! imgload command line
//!
//! Drives the loader against real sources and inspects the disk cache.
//!
//! ```text
//! imgload fetch https://example.com/a.png ./b.png bundle://icons/c.png
//! imgload stats
//! imgload inspect https://example.com/a.png
//! imgload sweep
//! imgload clear
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use tracing::{error, info, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use imgload::cache::{sanitize_key, DiskCacheKind, ImageContainer};
use imgload::loader::PassthroughDecoder;
use imgload::{ImageRequest, ImageService, LoaderConfig, LoaderMetrics, Priority};

// =============================================================================
// CLI Arguments
// =============================================================================

/// imgload - prioritized, deduplicated image loading with memory and disk caches
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "IMGLOAD_CONFIG")]
    config: Option<PathBuf>,

    /// Disk cache directory (overrides the config file)
    #[arg(long, env = "IMGLOAD_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Disk cache implementation (journaled, simple)
    #[arg(long, env = "IMGLOAD_DISK_KIND")]
    disk_kind: Option<DiskCacheKind>,

    /// Maximum concurrent loads
    #[arg(long, env = "IMGLOAD_MAX_PARALLEL")]
    max_parallel: Option<usize>,

    /// Print Prometheus metrics after the command
    #[arg(long)]
    metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load images through the caches
    Fetch {
        /// URLs, file paths, or bundle:// names
        #[arg(required = true)]
        sources: Vec<String>,

        #[arg(long, value_enum, default_value = "normal")]
        priority: PriorityArg,

        /// Write each loaded image into this directory
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print cache and scheduler statistics as JSON
    Stats,
    /// Delete every disk cache entry
    Clear,
    /// Remove expired disk cache entries
    Sweep,
    /// Show the disk cache record for a key
    Inspect { key: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorityArg {
    Low,
    Normal,
    High,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;
    info!("Starting imgload");
    info!("  Disk cache: {} ({:?})", config.disk.path.display(), config.disk.kind);
    info!(
        "  Max parallel tasks: {}",
        config.scheduler.resolved_max_parallel_tasks()
    );

    let service = ImageService::open(&config, PassthroughDecoder)
        .await
        .context("failed to start image service")?;

    match &args.command {
        Command::Fetch {
            sources,
            priority,
            output,
        } => {
            if let Some(dir) = output {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }

            let requests = sources
                .iter()
                .map(|source| ImageRequest::from_source(source).with_priority((*priority).into()));
            let results = join_all(requests.map(|request| {
                let key = request.key();
                let service = &service;
                async move { (key, service.load(request).await) }
            }))
            .await;

            let mut failures = 0;
            for (key, result) in results {
                match result {
                    Ok(loaded) => {
                        println!(
                            "{}\t{}\t{} bytes",
                            key,
                            loaded.result,
                            loaded.entry.container().size_in_bytes()
                        );
                        if let Some(dir) = output {
                            let path = dir.join(sanitize_key(&key));
                            tokio::fs::write(&path, loaded.entry.container().data())
                                .await
                                .with_context(|| format!("failed to write {}", path.display()))?;
                        }
                    }
                    Err(e) => {
                        error!("{}: {}", key, e);
                        println!("{}\terror\t{}", key, e);
                        failures += 1;
                    }
                }
            }
            if failures > 0 {
                print_metrics(&args, &service)?;
                service.shutdown().await;
                bail!("{} of {} images failed to load", failures, sources.len());
            }
        }
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&service.stats())?);
        }
        Command::Clear => {
            let disk = service.disk_cache().context("disk cache is disabled")?;
            let before = disk.stats().entries;
            service.clear_disk().await;
            println!("removed {} entries", before);
        }
        Command::Sweep => {
            let disk = service.disk_cache().context("disk cache is disabled")?;
            let removed = disk.sweep_expired(usize::MAX).await;
            println!("removed {} expired entries", removed);
        }
        Command::Inspect { key } => {
            let disk = service.disk_cache().context("disk cache is disabled")?;
            match disk.entry(key).await {
                Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
                None => println!("{} is not cached", key),
            }
        }
    }

    print_metrics(&args, &service)?;
    service.shutdown().await;
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<LoaderConfig> {
    let mut config = match &args.config {
        Some(path) => LoaderConfig::from_yaml_file(path)?,
        None => LoaderConfig::default(),
    };
    if let Some(dir) = &args.cache_dir {
        config.disk.path = dir.clone();
    }
    if let Some(kind) = args.disk_kind {
        config.disk.kind = kind;
    }
    if let Some(max) = args.max_parallel {
        config.scheduler.max_parallel_tasks = Some(max);
    }
    config.validate()?;
    Ok(config)
}

fn print_metrics(args: &Args, service: &ImageService<PassthroughDecoder>) -> anyhow::Result<()> {
    if args.metrics {
        let metrics = LoaderMetrics::new()?;
        metrics.update(&service.stats());
        print!("{}", metrics.encode_text()?);
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for quiet in ["hyper=warn", "reqwest=warn", "rustls=warn"] {
        if let Ok(directive) = quiet.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr; stdout carries command output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
