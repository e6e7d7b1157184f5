use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use run_task_orchestrator::{
    ca_bundle,
    config::{Cli, Command, TaskConfig},
    health, init_cmd, logging, override_cmd,
    orchestrator::Orchestrator,
    runner_api::RunnerApiClient,
    version::Version,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Init { ref src, ref dst } => init_cmd::run(src, dst),
        Command::Override { ref entrypoint } => override_cmd::run(entrypoint),
        Command::Version => {
            Version::new(cli.verbose).print();
            Ok(())
        }
        Command::RunTask => run_task(&cli),
    }
}

fn run_task(cli: &Cli) -> Result<()> {
    logging::init(&cli.log_level, cli.log_driver).context("init logging")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    let result = rt.block_on(run_task_async(cli));
    rt.shutdown_background();

    if let Some(delay) = cli.shutdown_delay {
        info!(?delay, "waiting out shutdown delay");
        std::thread::sleep(delay);
    }

    result
}

async fn run_task_async(cli: &Cli) -> Result<()> {
    let config = TaskConfig::from_env().context("load task configuration")?;
    info!(%config, "loaded task configuration");

    let extra_certs = match &cli.ca_bundle_dir {
        Some(dir) => ca_bundle::load_extra_certs(dir).context("load extra CA bundle")?,
        None => Vec::new(),
    };
    let runner_api = RunnerApiClient::new(config.runner_api_base_url.clone(), config.token.clone(), extra_certs)
        .context("build runner API client")?;

    let orchestrator = Orchestrator::new(config, runner_api, cli.termination_grace_period);
    let ready = orchestrator.ready_flag();

    let parent_shutdown = CancellationToken::new();
    let health_cancel = CancellationToken::new();

    tokio::spawn(signal_watcher(parent_shutdown.clone()));

    let health_task = tokio::spawn(health::serve(
        cli.health_check_addr.clone(),
        ready,
        health_cancel.clone(),
    ));

    let orchestrator_result = orchestrator.run(parent_shutdown).await;

    health_cancel.cancel();
    match health_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "health check endpoint exited with an error"),
        Err(e) => warn!(error = %e, "health check endpoint task panicked"),
    }

    orchestrator_result
}

async fn signal_watcher(parent_shutdown: CancellationToken) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to register SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to register SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    parent_shutdown.cancel();
}
