use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;
use stampede_service::config::Config;
use stampede_service::logging::ensure_log_error;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Drives synthetic load through the request collapsers.
#[derive(Parser, Debug)]
#[command(about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,

    /// Print logs as configured instead of discarding them.
    #[arg(long, short)]
    verbose: bool,
}

fn main() {
    match run() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let service_config = Config::get(cli.config.as_deref())?;

    // SAFETY: No other threads are running yet.
    let mut logging_guard = unsafe {
        logging::init(
            logging::Config {
                sentry: true,
                tracing: true,
                verbose: cli.verbose,
                metrics: true,
            },
            &service_config,
        )
    }?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(async move {
        if let Some(udp_sink) = logging_guard.udp_sink.take() {
            tokio::spawn(udp_sink);
        }

        perform_stresstest(service_config, workloads, cli.duration).await
    })
}
