//! mkit - parallel e2e runner for a local-Kubernetes launcher.
//!
//! Runs the registered scenarios against the binary under test, limited by
//! the parallelism governor, and exits non-zero if any of them failed.

#![forbid(unsafe_code)]

mod cli;
mod logging;
mod scenarios;
mod suite;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use mkit_common::governor::Governor;
use tracing::{info, warn};

use cli::Cli;
use suite::{Suite, TestCase};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("mkit: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let _guard = logging::init(cli.log_format, cli.verbose, cli.log_file.as_deref())?;

    let cases: Vec<TestCase> = scenarios::all()
        .into_iter()
        .filter(|c| cli.selects(c.name))
        .collect();
    if cli.list {
        for case in &cases {
            println!("{}", case.name);
        }
        return Ok(true);
    }

    let config = cli.invocation_config().context("invalid flags")?;
    let binary = config
        .resolve_binary()
        .context("locating the binary under test (set --binary)")?;
    info!(binary = %binary.display(), "binary under test");
    if let Err(err) = config.resolve_kubectl() {
        warn!(error = %err, "kubectl not found; cluster scenarios will fail");
    }
    if config.host.is_ci() {
        info!("running under CI");
    }

    let governor = Governor::install(cli.parallel);
    info!(workers = governor.workers(), "parallelism decided");

    let mut suite = Suite::new(Arc::new(config), governor).verbose(cli.verbose);
    if let Some(dir) = &cli.log_dir {
        suite = suite.log_dir(dir);
    }

    if cases.is_empty() {
        warn!("no tests match --run");
    }
    let started = Instant::now();
    let reports = suite.run(&cases).await;
    Ok(suite::summarize(&reports, started.elapsed()))
}
