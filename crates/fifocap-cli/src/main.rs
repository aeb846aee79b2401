mod capture;
mod check;
mod config;
#[cfg(feature = "usb")]
mod usb;

use std::process::ExitCode;

use clap::Parser;
use tracing::{info, warn};

use fifocap_engine::CancelFlag;

use crate::capture::CaptureOutcome;
use crate::config::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fifocap=info,fifocap_engine=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Capture(args) => {
            let cancel = CancelFlag::new();
            let handler_flag = cancel.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                handler_flag.cancel();
            });

            // The engine blocks in its wait primitive; keep it off the runtime.
            let session_flag = cancel.clone();
            let result =
                tokio::task::spawn_blocking(move || capture::run(&args, session_flag)).await?;
            capture_exit(result, cancel.is_cancelled())
        }
        Command::Check(args) => {
            let report = tokio::task::spawn_blocking(move || check::run(&args)).await??;
            if report.is_clean() {
                Ok(ExitCode::SUCCESS)
            } else {
                warn!("{} errors found", report.errors);
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

/// A user-requested abort exits cleanly even if the session then failed.
fn capture_exit(result: anyhow::Result<CaptureOutcome>, cancelled: bool) -> anyhow::Result<ExitCode> {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) if cancelled => {
            warn!("Capture aborted: {:#}", e);
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => return Err(e),
    };
    if outcome.session.is_none() {
        info!("Peripheral went quiet, session ended");
    }
    if outcome.integrity.is_some_and(|r| !r.is_clean()) {
        warn!("Captured stream has sequence errors");
    }
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Can't install SIGTERM handler: {}", e);
                    ctrl_c.await.ok();
                    info!("Received Ctrl+C, draining...");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, draining..."),
            _ = sigterm.recv() => info!("Received SIGTERM, draining..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, draining...");
    }
}
