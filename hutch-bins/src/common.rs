//! Common utilities for all binaries
//!
//! Shared CLI arguments, configuration loading and logging setup.

use anyhow::Result;
use clap::Args;
use hutch_core::config::HutchConfig;
use hutch_core::utils::init_logger;
use std::path::PathBuf;

/// Common CLI arguments for all binaries
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// TOML configuration file (HUTCH_* environment variables override it)
    #[arg(short, long, env = "HUTCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Broker URL, overrides the configuration
    #[arg(short, long)]
    pub url: Option<String>,

    /// Log level, overrides the configuration
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    pub json_logs: bool,
}

impl CommonArgs {
    /// Load configuration and apply command line overrides
    pub fn load_config(&self) -> Result<HutchConfig> {
        let mut config = HutchConfig::load(self.config.as_deref())?;

        if let Some(url) = &self.url {
            config.broker.url = url.clone();
        }
        if let Some(level) = &self.log_level {
            config.monitoring.log_level = level.clone();
        }
        if self.json_logs {
            config.monitoring.json_logs = true;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Initialize tracing/logging from the monitoring section
pub fn init_logging(config: &HutchConfig) -> Result<()> {
    init_logger(&config.monitoring.log_level, config.monitoring.json_logs)
}

/// Broker URL with credentials masked, for logs
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
