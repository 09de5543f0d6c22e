//! uperf CLI entry point

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use uperf::config::cli::{Cli, ExecutionMode};
use uperf::config::toml::parse_profile_file;
use uperf::config::RunOptions;
use uperf::distributed::{DistributedCoordinator, NodeService};

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(&cli);
    cli.validate()?;

    match cli.mode {
        ExecutionMode::Slave => build_runtime()?.block_on(run_slave(&cli)),
        ExecutionMode::Master => {
            // process strands fork here, while no runtime thread exists yet
            let coordinator = prepare_master(&cli)?;
            let runtime = build_runtime()?;
            let report = runtime.block_on(coordinator.run())?;
            if cli.json {
                println!("{}", report.to_json()?);
            } else {
                report.print();
            }
            // let strands and readers wind down before exiting with the run status
            drop(runtime);
            std::process::exit(report.exit_code())
        }
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to create tokio runtime")
}

/// `RUST_LOG` wins over `--debug`
fn init_logging(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run_slave(cli: &Cli) -> Result<()> {
    let mut options = RunOptions::default();
    cli.apply(&mut options);
    options.validate().map_err(anyhow::Error::msg)?;

    let service = NodeService::bind(("0.0.0.0", options.port), options)
        .await
        .context("Failed to start slave")?;
    service.run().await
}

/// Load the profile and set up the master's local strands
fn prepare_master(cli: &Cli) -> Result<DistributedCoordinator> {
    let path = cli.profile.as_deref().context("No profile given")?;
    let profile = parse_profile_file(path)?;
    let mut options = profile.options.clone();
    cli.apply(&mut options);
    options
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid run options")?;

    let workorder = profile.to_workorder()?;
    let mut coordinator = DistributedCoordinator::new(workorder, options)?;
    coordinator.prepare()?;
    Ok(coordinator)
}
