//! Layered configuration: compiled-in defaults, an optional TOML file, CLI
//! flags, then environment variables for the one secret-shaped key —
//! outermost wins. Modeled on `internal/derperer/config.go`'s key set,
//! loaded the way `clap`'s derive API is used elsewhere in the pack rather
//! than the Go original's `viper`/`pflag` combination.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_refetch_interval() -> Duration {
    Duration::from_secs(600)
}
fn default_fetch_limit() -> usize {
    100
}
fn default_recheck_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_check_duration() -> Duration {
    Duration::from_secs(10)
}
fn default_check_concurrency() -> usize {
    10
}
fn default_baseline_bandwidth() -> f64 {
    2.0 * 1024.0 * 1024.0
}
fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

/// The service's runtime configuration, loaded once at startup and shared
/// by `Arc` with every long-running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(with = "humantime_serde", default = "default_refetch_interval")]
    pub refetch_interval: Duration,
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
    #[serde(with = "humantime_serde", default = "default_recheck_interval")]
    pub recheck_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_check_duration")]
    pub check_duration: Duration,
    #[serde(default = "default_check_concurrency")]
    pub check_concurrency: usize,
    #[serde(default = "default_baseline_bandwidth")]
    pub baseline_bandwidth: f64,
    #[serde(default)]
    pub cn: bool,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    pub admin_token: String,
    #[serde(default)]
    pub fofa_email: String,
    #[serde(default)]
    pub fofa_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refetch_interval: default_refetch_interval(),
            fetch_limit: default_fetch_limit(),
            recheck_interval: default_recheck_interval(),
            check_duration: default_check_duration(),
            check_concurrency: default_check_concurrency(),
            baseline_bandwidth: default_baseline_bandwidth(),
            cn: false,
            address: default_address(),
            admin_token: String::new(),
            fofa_email: String::new(),
            fofa_key: String::new(),
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.address
            .parse()
            .map_err(|err| ConfigError::InvalidAddress(self.address.clone(), err))
    }
}

/// Process-level CLI flags, layered on top of an optional config file.
#[derive(Debug, Parser)]
#[command(author, version, about = "Discovers, probes and curates third-party relays")]
pub struct Args {
    /// Path to a TOML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub refetch_interval: Option<String>,
    #[arg(long)]
    pub fetch_limit: Option<usize>,
    #[arg(long)]
    pub recheck_interval: Option<String>,
    #[arg(long)]
    pub check_duration: Option<String>,
    #[arg(long)]
    pub check_concurrency: Option<usize>,
    #[arg(long)]
    pub baseline_bandwidth: Option<f64>,
    #[arg(long)]
    pub cn: bool,
    #[arg(long)]
    pub address: Option<String>,
    #[arg(long)]
    pub admin_token: Option<String>,
    #[arg(long)]
    pub fofa_email: Option<String>,
    #[arg(long)]
    pub fofa_key: Option<String>,
}

/// Builds the effective [`Config`]: defaults, overridden by an optional
/// TOML file, overridden by CLI flags, overridden by environment variables
/// for `admin_token`/the fofa secrets.
pub fn load(args: &Args) -> Result<Config, ConfigError> {
    let mut config = match &args.config {
        Some(path) => load_file(path)?,
        None => Config::default(),
    };

    if let Some(value) = &args.refetch_interval {
        config.refetch_interval = parse_duration("refetch_interval", value)?;
    }
    if let Some(value) = args.fetch_limit {
        config.fetch_limit = value;
    }
    if let Some(value) = &args.recheck_interval {
        config.recheck_interval = parse_duration("recheck_interval", value)?;
    }
    if let Some(value) = &args.check_duration {
        config.check_duration = parse_duration("check_duration", value)?;
    }
    if let Some(value) = args.check_concurrency {
        config.check_concurrency = value;
    }
    if let Some(value) = args.baseline_bandwidth {
        config.baseline_bandwidth = value;
    }
    if args.cn {
        config.cn = true;
    }
    if let Some(value) = &args.address {
        config.address = value.clone();
    }
    if let Some(value) = &args.admin_token {
        config.admin_token = value.clone();
    }
    if let Some(value) = &args.fofa_email {
        config.fofa_email = value.clone();
    }
    if let Some(value) = &args.fofa_key {
        config.fofa_key = value.clone();
    }

    if let Ok(value) = std::env::var("ADMIN_TOKEN") {
        config.admin_token = value;
    }
    if let Ok(value) = std::env::var("FOFA_EMAIL") {
        config.fofa_email = value;
    }
    if let Ok(value) = std::env::var("FOFA_KEY") {
        config.fofa_key = value;
    }

    // Validated eagerly so a malformed listen address fails fast at
    // startup rather than when the HTTP server tries to bind.
    config.listen_addr()?;

    Ok(config)
}

fn load_file(path: &PathBuf) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
        path: path.display().to_string(),
        source: err,
    })?;
    toml::from_str(&contents).map_err(|err| ConfigError::Parse {
        path: path.display().to_string(),
        source: err,
    })
}

fn parse_duration(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|source| ConfigError::InvalidDuration { key, source })
}
