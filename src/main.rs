//! syncx: stress harness for call deduplication, shared resources and limiting
//!
//! Puts the `flight-sync` primitives under concurrent load on a multi-threaded
//! runtime and exits non-zero if any of their guarantees is violated.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};

use syncx::cli::Args;
use syncx::{run_scenarios, ProgressTracker};

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging based on verbosity and quiet mode
    if !args.quiet {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(match args.verbose {
                0 => Level::WARN,
                1 => Level::INFO,
                2 => Level::DEBUG,
                _ => Level::TRACE,
            })
            .with_target(false)
            .with_thread_ids(args.verbose > 2)
            .with_thread_names(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        // In quiet mode, only log errors
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::ERROR)
            .with_target(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)?;
    }

    // Validate arguments
    args.validate().context("Invalid arguments")?;

    let worker_threads = args.effective_worker_threads();
    if !args.quiet {
        info!("Starting syncx v{}", env!("CARGO_PKG_VERSION"));
        info!("Scenario: {:?}", args.scenario);
        info!("Callers per key: {}", args.callers);
        info!("Keys: {}", args.keys);
        info!("Limit capacity: {}", args.capacity);
        info!("Work: {} ms", args.work_ms);
        info!("Rounds: {}", args.rounds);
        info!("Worker threads: {}", worker_threads);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    let progress = if args.progress && !args.quiet {
        ProgressTracker::new(args.total_rounds())
    } else {
        ProgressTracker::hidden()
    };

    let config = args.scenario_config();
    let reports = runtime
        .block_on(run_scenarios(args.scenario, &config, &progress))
        .context("Stress run failed")?;
    progress.finish();

    if !args.quiet {
        for report in &reports {
            println!("{report}");
        }
    }

    Ok(())
}
