//! biodist - Distributed Record Processing with Supervised Workers
//!
//! Entry point for the CLI application.

use anyhow::{bail, Context, Result};
use biodist::config::{CliArgs, Command, InputSource, Resources};
use biodist::job::runtime::{self, WorkerLaunch};
use biodist::progress::{print_header, print_summary};
use biodist::store::{DirectoryRecordStore, RecordStore};
use biodist::TaskStatus;
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args = CliArgs::parse();

    // Workers own stdout as their message channel, so logs go to stderr
    setup_logging(args.verbose)?;

    match args.command {
        Command::Run {
            job,
            receivers,
            checkpoint,
            progress,
        } => {
            if progress {
                let resources = Resources::load(&job.properties, checkpoint)
                    .context("Invalid job properties")?;
                print_header(
                    &store_description(&resources),
                    receivers,
                    resources.workers_per_node,
                    resources.chunk_size,
                );
            }

            let launch = WorkerLaunch::current_exe(args.verbose)?;
            let result = runtime::run_local(&job, receivers, checkpoint, progress, &launch)
                .context("Job failed")?;

            print_summary(&result.summary, &result.receivers);
            if !result.summary.completed {
                bail!("Job ended early: {}", result.summary.reason);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Distribute {
            properties,
            listen,
            receivers,
            checkpoint,
            progress,
        } => {
            if progress {
                let resources = Resources::load(&properties, checkpoint)
                    .context("Invalid job properties")?;
                print_header(
                    &store_description(&resources),
                    receivers,
                    resources.workers_per_node,
                    resources.chunk_size,
                );
            }

            let summary =
                runtime::run_tcp_distributor(&properties, &listen, receivers, checkpoint, progress)
                    .context("Distribution failed")?;

            print_summary(&summary, &[]);
            if !summary.completed {
                bail!("Distribution ended early: {}", summary.reason);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Receive { job, connect } => {
            let launch = WorkerLaunch::current_exe(args.verbose)?;
            let outcome = runtime::run_tcp_receiver(&job, &connect, &launch)
                .context("Receiver failed")?;

            info!(status = %outcome.status, reason = %outcome.reason, packages = outcome.packages, "Receiver done");
            Ok(exit_code(outcome.status))
        }

        Command::Worker { job } => {
            let status = runtime::run_worker(&job).context("Worker failed")?;
            Ok(exit_code(status))
        }

        Command::ShowConfig {
            properties,
            checkpoint,
        } => {
            let resources =
                Resources::load(&properties, checkpoint).context("Invalid job properties")?;
            println!("{}", serde_json::to_string_pretty(&resources)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(status: TaskStatus) -> ExitCode {
    match status {
        TaskStatus::Ok | TaskStatus::Exit => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}

fn store_description(resources: &Resources) -> String {
    match resources.input_source() {
        Ok(InputSource::RecordStore(path)) => DirectoryRecordStore::open(path)
            .map(|store| store.description())
            .unwrap_or_else(|_| "<unavailable>".to_string()),
        Ok(InputSource::Csv(path)) => format!("{} (CSV lines)", path.display()),
        Err(_) => "<unavailable>".to_string(),
    }
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("biodist=debug,warn")
    } else {
        EnvFilter::new("biodist=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
