use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;

use viewcache_service::config::Config as ServiceConfig;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Command line interface parser.
#[derive(Parser)]
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

    /// Enable the tracing machinery, writing into the void.
    #[arg(long)]
    tracing: bool,

    /// Log to the console, as configured in the configuration file.
    #[arg(long, conflicts_with = "tracing")]
    logs: bool,

    /// Report metrics to a local statsd sink.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    if let Err(error) = run() {
        viewcache_service::logging::ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let service_config = ServiceConfig::get(cli.config.as_deref())?;

    // SAFETY: no other threads have been spawned yet.
    unsafe { std::env::set_var("RUST_BACKTRACE", "1") };

    if cli.logs {
        // SAFETY: see above.
        unsafe { viewcache_service::logging::init_logging(&service_config) };
    }

    let _sentry = service_config.sentry_dsn.clone().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                traces_sample_rate: 1.0,
                ..Default::default()
            },
        ))
    });

    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("viewcache-stress")
        .thread_stack_size(8 * megs)
        .enable_all()
        .build()?;

    let guard = runtime.block_on(async {
        logging::init(logging::Config {
            tracing: cli.tracing,
            metrics: cli.metrics,
        })
    })?;

    if let Some(udp_sink) = guard.udp_sink {
        runtime.spawn(udp_sink);
    }

    runtime.block_on(perform_stresstest(service_config, workloads, cli.duration))
}
