use anyhow::{Context, Result};
use cellstream_cache::CacheConfig;
use cellstream_core::{CacheHints, CellLoader, LoadingStrategy, UniformGeometry, VolatileCellCache};
use cellstream_scheduler::{BoxError, TaskGroup};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cellstream")]
#[command(about = "Cellstream cell cache CLI")]
pub struct Cli {
    /// Log cache activity to stderr (RUST_LOG overrides the level).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Drive the cache with a synthetic backend and report statistics.
    Simulate(SimulateArgs),
    /// Print the effective cache configuration.
    Config {
        /// Configuration file to load instead of the default location.
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Write the effective configuration to FILE.
        #[arg(long, value_name = "FILE")]
        save: Option<PathBuf>,
        /// Print the default configuration file location and exit.
        #[arg(long)]
        path: bool,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Configuration file to load instead of the default location.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Loading strategy: volatile, blocking, budgeted or dontload.
    #[arg(long, default_value = "volatile")]
    strategy: String,
    /// Number of frames to render.
    #[arg(long, default_value_t = 5)]
    frames: usize,
    /// Full resolution image size, comma separated.
    #[arg(long, value_delimiter = ',', default_value = "256,256")]
    image: Vec<u64>,
    /// Cell shape, comma separated.
    #[arg(long, value_delimiter = ',', default_value = "64,64")]
    cell: Vec<usize>,
    /// Resolution levels per setup.
    #[arg(long, default_value_t = 3)]
    levels: usize,
    /// Number of setups.
    #[arg(long, default_value_t = 1)]
    setups: usize,
    /// Simulated backend latency per cell in milliseconds.
    #[arg(long, default_value_t = 1)]
    latency_ms: u64,
    /// IO time budget per frame in milliseconds for budgeted loading.
    #[arg(long, default_value_t = 10)]
    budget_ms: u64,
    /// Pause between frames in milliseconds.
    #[arg(long, default_value_t = 16)]
    frame_interval_ms: u64,
    /// Override the number of fetcher threads.
    #[arg(long)]
    threads: Option<usize>,
    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

/// Backend that synthesizes cells after a fixed delay.
struct SyntheticLoader {
    latency: Duration,
}

impl CellLoader<u16> for SyntheticLoader {
    fn load(
        &self,
        timepoint: u32,
        setup: u32,
        level: u32,
        dims: &[usize],
        min: &[i64],
    ) -> std::result::Result<Vec<u16>, BoxError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        let seed = min.iter().sum::<i64>() as u64 + u64::from(timepoint + setup + level);
        let len: usize = dims.iter().product();
        Ok((0..len as u64).map(|i| (seed + i) as u16).collect())
    }
}

#[derive(Debug, Serialize)]
struct FrameReport {
    frame: i64,
    requested: u64,
    valid: u64,
}

#[derive(Debug, Serialize)]
struct RequestReport {
    volatile: u64,
    blocking: u64,
    budgeted: u64,
    dont_load: u64,
}

#[derive(Debug, Serialize)]
struct StoreReport {
    slots: usize,
    hits: u64,
    misses: u64,
    loads: u64,
    reaped: u64,
    retained_entries: usize,
    retained_bytes: usize,
}

#[derive(Debug, Serialize)]
struct IoReport {
    io_time_ms: f64,
    io_bytes: u64,
    inline_loads: u64,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    strategy: String,
    frames: Vec<FrameReport>,
    requests: RequestReport,
    inline_loads: u64,
    enqueued: u64,
    background_loads: u64,
    budget_exhausted: u64,
    failures: u64,
    demoted: u64,
    store: StoreReport,
    io: IoReport,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging(cli.verbose);

    match cli.command {
        Commands::Simulate(args) => run_simulate(&args),
        Commands::Config { config, save, path } => run_config(config.as_deref(), save.as_deref(), path),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // A second call in the same process keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Explicit file, else the default location if it exists, else defaults;
/// environment variables apply last.
fn load_config(path: Option<&Path>) -> Result<CacheConfig> {
    let config = match path {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let default_path = CacheConfig::default_config_path();
            if default_path.is_file() {
                debug!(path = %default_path.display(), "Loading default config");
                CacheConfig::from_file(&default_path).with_context(|| {
                    format!("failed to load config from {}", default_path.display())
                })?
            } else {
                CacheConfig::default()
            }
        }
    };
    config.with_env_overrides().context("invalid environment override")
}

fn run_config(config: Option<&Path>, save: Option<&Path>, path: bool) -> Result<()> {
    if path {
        println!("{}", CacheConfig::default_config_path().display());
        return Ok(());
    }

    let config = load_config(config)?;
    if let Some(save) = save {
        config
            .save_to_file(save)
            .with_context(|| format!("failed to write config to {}", save.display()))?;
        println!("{}", save.display());
        return Ok(());
    }

    print!("{}", config.to_toml()?);
    Ok(())
}

fn run_simulate(args: &SimulateArgs) -> Result<()> {
    let strategy: LoadingStrategy = args.strategy.parse()?;
    let mut config = load_config(args.config.as_deref())?;
    if let Some(threads) = args.threads {
        config = config.with_fetcher_threads(threads);
    }

    let geometry = UniformGeometry::new(args.setups, args.image.clone(), args.cell.clone(), args.levels)
        .context("invalid cell geometry")?;
    let loader = SyntheticLoader { latency: Duration::from_millis(args.latency_ms) };
    let cache = VolatileCellCache::<u16>::new(Arc::new(loader), Arc::new(geometry), &config)
        .context("failed to start cell cache")?;

    let group = TaskGroup::new("simulate");
    let budget_ns = i64::try_from(args.budget_ms.saturating_mul(1_000_000)).unwrap_or(i64::MAX);
    let frame_interval = Duration::from_millis(args.frame_interval_ms);

    let mut frames = Vec::with_capacity(args.frames);
    for _ in 0..args.frames {
        let frame = cache.prepare_next_frame();
        cache.init_io_time_budget(&group, &[budget_ns], false)?;

        // The renderer holds its cells for the whole pass, coarse levels first.
        let mut held = Vec::new();
        let mut report = FrameReport { frame, requested: 0, valid: 0 };
        for setup in 0..args.setups as u32 {
            for level in (0..args.levels as u32).rev() {
                let view = cache.view(0, setup, level);
                let priority = view.cache_hints().priority;
                let view = view.with_cache_hints(CacheHints::new(strategy, priority, false));
                for index in 0..view.num_cells() {
                    let cell = view.get(index, &group)?;
                    report.requested += 1;
                    if cell.is_valid() {
                        report.valid += 1;
                    }
                    held.push(cell);
                }
            }
        }
        info!(frame, requested = report.requested, valid = report.valid, "Frame rendered");
        frames.push(report);

        if !frame_interval.is_zero() {
            thread::sleep(frame_interval);
        }
        drop(held);
    }

    let stats = cache.stats();
    let io = group.snapshot();
    cache.shutdown();

    let report = SimulationReport {
        strategy: strategy.to_string(),
        frames,
        requests: RequestReport {
            volatile: stats.requests.volatile,
            blocking: stats.requests.blocking,
            budgeted: stats.requests.budgeted,
            dont_load: stats.requests.dont_load,
        },
        inline_loads: stats.inline_loads,
        enqueued: stats.enqueued,
        background_loads: stats.background_loads,
        budget_exhausted: stats.budget_exhausted,
        failures: stats.failures,
        demoted: stats.queue.demoted,
        store: StoreReport {
            slots: stats.store.slots,
            hits: stats.store.hits,
            misses: stats.store.misses,
            loads: stats.store.loads,
            reaped: stats.store.reaped,
            retained_entries: stats.store.retention.entries,
            retained_bytes: stats.store.retention.memory_used,
        },
        io: IoReport {
            io_time_ms: io.io_time.as_secs_f64() * 1000.0,
            io_bytes: io.io_bytes,
            inline_loads: io.inline_loads,
        },
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, stats.store.hit_rate());
    }
    Ok(())
}

fn print_report(report: &SimulationReport, hit_rate: f64) {
    println!("strategy: {}", report.strategy);
    for frame in &report.frames {
        println!("frame {}: {}/{} cells valid", frame.frame, frame.valid, frame.requested);
    }
    let requests = &report.requests;
    println!(
        "requests: volatile {}, blocking {}, budgeted {}, dontload {}",
        requests.volatile, requests.blocking, requests.budgeted, requests.dont_load
    );
    println!(
        "loads: {} inline, {} background, {} enqueued, {} demoted, {} failed",
        report.inline_loads, report.background_loads, report.enqueued, report.demoted, report.failures
    );
    println!(
        "store: {} slots, {} hits, {} misses, hit rate {:.1}%",
        report.store.slots,
        report.store.hits,
        report.store.misses,
        hit_rate * 100.0
    );
    println!(
        "inline io: {:.2} ms, {} bytes, budget exhausted {} times",
        report.io.io_time_ms, report.io.io_bytes, report.budget_exhausted
    );
}
