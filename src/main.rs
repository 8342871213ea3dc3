// src/main.rs
//! swift-mirror - CLI entry point

use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use swift_mirror::actors::{run_pipeline, Report};
use swift_mirror::config::{compile_jobs, read_configuration};
use swift_mirror::{env_bool, transfer};

#[derive(Parser)]
#[command(name = "swift-mirror")]
#[command(version)]
#[command(about = "Mirror HTTP, Yum, Debian, GitHub-release and Swift sources into Swift object storage", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    config_file: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let start_time = Instant::now();

    let default_level = if env_bool("DEBUG") { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
    transfer::set_log_individual_transfers(env_bool("LOG_TRANSFERS"));

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{e}");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprint!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // read configuration; all validation errors are reported together
    let config_path = cli.config_file.to_string_lossy().to_string();
    let mut config = match read_configuration(&config_path) {
        Ok(config) => config,
        Err(errors) => {
            for e in errors {
                error!("{}", e);
            }
            return ExitCode::FAILURE;
        }
    };
    let jobs = match compile_jobs(&mut config).await {
        Ok(jobs) => jobs,
        Err(errors) => {
            for e in errors {
                error!("{}", e);
            }
            return ExitCode::FAILURE;
        }
    };

    // cooperative shutdown on SIGINT/SIGTERM
    let ctx = CancellationToken::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("interrupt received, shutting down...");
            ctx.cancel();
        });
    }

    let (report_tx, report_rx) = mpsc::channel(10);
    let report_task = tokio::spawn(
        Report {
            input: report_rx,
            statsd: config.statsd.clone(),
            start_time,
        }
        .run(),
    );

    run_pipeline(&ctx, jobs, config.workers.transfer, report_tx).await;

    // all event senders are gone now; the reporter finalizes
    let summary = match report_task.await {
        Ok(summary) => summary,
        Err(e) => {
            error!("report actor failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    ExitCode::from(summary.exit_code as u8)
}

async fn shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(e) => {
            error!("cannot listen for SIGTERM: {}", e);
            // fall back to SIGINT only
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
