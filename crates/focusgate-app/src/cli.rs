//! Command line arguments.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use focusgate_proxy::SessionConfig;

/// Focusgate - block distracting sites for the length of a focus session
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "focusgate", version, about)]
pub struct Args {
    /// Sites to block, comma separated (e.g. youtube.com,reddit.com)
    #[arg(long, value_delimiter = ',')]
    pub sites: Vec<String>,

    /// Port to listen on (the next free port is used if taken)
    #[arg(long)]
    pub port: Option<u16>,

    /// JSON session config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// End the session after this many minutes (runs until Ctrl-C otherwise)
    #[arg(long)]
    pub minutes: Option<u64>,

    /// Leave the OS proxy settings untouched
    #[arg(long)]
    pub no_system_proxy: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl Args {
    /// Builds the session config: config file first, then command line overrides.
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => SessionConfig::default(),
        };

        if let Some(port) = self.port {
            config.engine.port = port;
        }
        if self.no_system_proxy {
            config.system_proxy = false;
        }
        if !self.sites.is_empty() {
            config.sites = self.sites.clone();
        }

        Ok(config)
    }

    /// Returns the session length, if one was given.
    pub fn duration(&self) -> Option<Duration> {
        self.minutes.map(|m| Duration::from_secs(m.saturating_mul(60)))
    }

    /// Returns the effective log level.
    pub fn effective_log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }
}
