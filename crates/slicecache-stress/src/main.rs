//! Drives a frame engine with synthetic scrubbing workloads and reports how it copes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use slicecache_service::config::Config;

mod logging;
mod stresstest;
mod workloads;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Command line interface parser.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Print the results as JSON.
    #[arg(long)]
    json: bool,
}

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();

    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: workloads::WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    // SAFETY: no other threads have been started yet.
    let _sentry = unsafe { logging::init(&config) }?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;
    let reports = runtime.block_on(stresstest::perform_stresstest(
        config,
        workloads,
        cli.duration,
    ))?;

    if cli.json {
        let stdout = std::io::stdout().lock();
        serde_json::to_writer_pretty(stdout, &reports).context("failed to write report")?;
        println!();
    } else {
        for report in &reports {
            println!("{report}");
        }
    }

    Ok(())
}
