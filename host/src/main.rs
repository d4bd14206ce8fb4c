use std::{io, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use rma_shared::{engine, fabric::shm::ShmFabric, RunConfig};
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::command_line::{GlobalArgs, Transport};

mod command_line;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = GlobalArgs::parse();

    exit_code(run(args))
}

/// Logs a fatal error once and maps the outcome to the process exit status.
fn exit_code(outcome: anyhow::Result<()>) -> ExitCode {
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: GlobalArgs) -> anyhow::Result<()> {
    let config = RunConfig::new(args.bench.into()).context("invalid benchmark parameters")?;
    let mut stdout = io::stdout().lock();

    match args.transport {
        Transport::Shm(shm) => {
            let fabric = ShmFabric::join(shm.into()).context("failed to join the session")?;
            engine::run(&fabric, &config, &mut stdout)?;
        }
        #[cfg(feature = "verbs")]
        Transport::Verbs(verbs) => {
            let fabric = rma_shared::rdma_controller::VerbsFabric::connect(verbs.into())
                .context("failed to connect to the verbs peer")?;
            engine::run(&fabric, &config, &mut stdout)?;
        }
    }

    Ok(())
}
