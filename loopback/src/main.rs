use std::{io, process::ExitCode, thread};

use anyhow::{anyhow, Context};
use clap::Parser;
use rma_shared::{command_line::BenchArgs, engine, fabric::loopback::LoopbackFabric, RunConfig};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Runs source and sink as two ranks inside this process. Useful to check
/// the harness itself and to measure the cost of the put path without a
/// transport underneath.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct GlobalArgs {
    #[command(flatten)]
    bench: BenchArgs,
}

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
    let (source, sink) = LoopbackFabric::pair();

    let (source_outcome, sink_outcome) = thread::scope(|scope| {
        let sink_rank = thread::Builder::new()
            .name("rank-1".into())
            .spawn_scoped(scope, || engine::run(&sink, &config, &mut io::sink()))?;

        let source_outcome = engine::run(&source, &config, &mut io::stdout().lock());
        let sink_outcome = sink_rank
            .join()
            .map_err(|_| anyhow!("sink rank panicked"))?;

        anyhow::Ok((source_outcome, sink_outcome))
    })?;

    source_outcome.context("source rank failed")?;
    sink_outcome.context("sink rank failed")?;

    Ok(())
}
