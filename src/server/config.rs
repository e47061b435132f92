//! Configuration types and constants for the haven server.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use crate::config::{
    parse_backoff_list, OrchestratorConfig, DEFAULT_LOCATION_INTERVAL_SECS, DEFAULT_MAX_RETRIES,
    DEFAULT_PING_HISTORY,
};

pub(crate) const DEFAULT_BIND: &str = "127.0.0.1:3100";
pub(crate) const MAX_WS_CONNECTIONS: usize = 256;
/// Latency of each simulated capability attempt.
pub(crate) const SIMULATED_LATENCY_MS: u64 = 300;
pub(crate) const NOTIFIER_TIMEOUT_SECS: u64 = 10;

/// Emergency session orchestrator.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug, Default)]
#[command(name = "haven-server", version, about)]
pub struct Cli {
    /// HTTP server bind address [env: HAVEN_BIND] [default: 127.0.0.1:3100]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// TOML identity directory (tokens, contacts, PIN digests) [env: HAVEN_DIRECTORY]
    #[arg(long, short = 'd')]
    pub directory: Option<PathBuf>,

    /// SQLite session journal; sessions are memory-only without it [env: HAVEN_DB]
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Retries per action before it fails [env: HAVEN_MAX_RETRIES] [default: 3]
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Comma-separated backoff schedule in ms [env: HAVEN_RETRY_BACKOFF_MS] [default: 1000,2000,4000]
    #[arg(long)]
    pub retry_backoff_ms: Option<String>,

    /// Minimum seconds between accepted pings [env: HAVEN_LOCATION_INTERVAL_SECS] [default: 8]
    #[arg(long)]
    pub location_interval_secs: Option<u64>,

    /// Pings kept per session [env: HAVEN_PING_HISTORY] [default: 50]
    #[arg(long)]
    pub ping_history: Option<usize>,

    /// Notifier service base URL; simulated capabilities are used without it [env: HAVEN_NOTIFIER_URL]
    #[arg(long, short = 'n')]
    pub notifier_url: Option<String>,

    /// Failure probability of simulated capabilities, 0.0-1.0 [env: HAVEN_FAILURE_RATE] [default: 0]
    #[arg(long)]
    pub failure_rate: Option<f64>,

    /// Safety PIN accepted for anonymous sessions [env: HAVEN_ANONYMOUS_PIN]
    #[arg(long)]
    pub anonymous_pin: Option<String>,
}

pub struct Config {
    pub bind_addr: String,
    pub directory: Option<PathBuf>,
    pub db: Option<PathBuf>,
    pub orchestrator: OrchestratorConfig,
    pub notifier_url: Option<String>,
    pub failure_rate: f64,
    pub anonymous_pin: Option<String>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: FromStr>(name: &str) -> Result<Option<T>, String> {
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("{name}: cannot parse {raw:?}")),
        None => Ok(None),
    }
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Result<Self, String> {
        let bind_addr = cli
            .bind
            .or_else(|| env_var("HAVEN_BIND"))
            .unwrap_or_else(|| DEFAULT_BIND.to_string());

        let directory = cli
            .directory
            .or_else(|| env_var("HAVEN_DIRECTORY").map(PathBuf::from));
        let db = cli.db.or_else(|| env_var("HAVEN_DB").map(PathBuf::from));

        let max_retries = match cli.max_retries {
            Some(v) => v,
            None => env_parsed("HAVEN_MAX_RETRIES")?.unwrap_or(DEFAULT_MAX_RETRIES),
        };

        let mut orchestrator = OrchestratorConfig {
            max_retries,
            ..OrchestratorConfig::default()
        };
        if let Some(raw) = cli
            .retry_backoff_ms
            .or_else(|| env_var("HAVEN_RETRY_BACKOFF_MS"))
        {
            orchestrator.retry_backoff = parse_backoff_list(&raw)?;
        }
        let interval = match cli.location_interval_secs {
            Some(v) => v,
            None => env_parsed("HAVEN_LOCATION_INTERVAL_SECS")?
                .unwrap_or(DEFAULT_LOCATION_INTERVAL_SECS),
        };
        orchestrator.location_interval = Duration::from_secs(interval);
        orchestrator.ping_history = match cli.ping_history {
            Some(v) => v,
            None => env_parsed("HAVEN_PING_HISTORY")?.unwrap_or(DEFAULT_PING_HISTORY),
        };
        if orchestrator.ping_history == 0 {
            return Err("ping history must be at least 1".to_string());
        }

        let notifier_url = cli
            .notifier_url
            .or_else(|| env_var("HAVEN_NOTIFIER_URL"));

        let failure_rate = match cli.failure_rate {
            Some(v) => v,
            None => env_parsed("HAVEN_FAILURE_RATE")?.unwrap_or(0.0),
        };
        if !(0.0..=1.0).contains(&failure_rate) {
            return Err(format!("failure rate must be within 0.0-1.0, got {failure_rate}"));
        }

        let anonymous_pin = cli
            .anonymous_pin
            .or_else(|| env_var("HAVEN_ANONYMOUS_PIN"));

        Ok(Self {
            bind_addr,
            directory,
            db,
            orchestrator,
            notifier_url,
            failure_rate,
            anonymous_pin,
        })
    }
}
