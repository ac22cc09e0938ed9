//! Focusgate - block distracting sites during focus sessions.
//!
//! Runs one focus session: starts the blocking proxy, points the OS proxy
//! settings at it, and restores them on Ctrl-C or when the session time is up.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use focusgate_app::Args;
use focusgate_proxy::SessionController;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "focusgate", "Focusgate").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = args.effective_log_level();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "focusgate={0},focusgate_app={0},focusgate_proxy={0},warn",
            log_level
        ))
    });

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("focusgate")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Waits for Ctrl-C, or for the session time to run out.
async fn wait_for_session_end(args: &Args) {
    let timer = async {
        match args.duration() {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            }
            tracing::info!("Interrupted, ending session");
        }
        _ = timer => {
            tracing::info!("Session time is up");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Focusgate...");
    tracing::debug!("Args: {:?}", args);

    let config = args.session_config()?;
    let controller = SessionController::from_config(&config).on_proxy_action(|action, host, port| {
        tracing::info!("System proxy {} for {}:{}", action, host, port);
    });

    let result = controller.start_session(&config.sites).await;
    if !result.ok {
        anyhow::bail!(
            "Failed to start session: {}",
            result.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    let status = controller.status().await;
    if let Some(port) = status.port {
        let enabled = controller.system_proxy().is_enabled("127.0.0.1", port).await;
        tracing::info!(
            "Proxy on 127.0.0.1:{} ({} system proxy, active: {})",
            port,
            controller.system_proxy(),
            enabled
        );
    }
    println!(
        "{}",
        serde_json::to_string(&status).context("Failed to serialize session status")?
    );

    wait_for_session_end(&args).await;

    // Always restore the OS proxy settings before exiting.
    let result = controller.end_session().await;
    if let Some(error) = result.error {
        tracing::warn!("Session did not end cleanly: {}", error);
    }

    tracing::info!("Focusgate shutting down");
    Ok(())
}
