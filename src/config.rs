//! Balancer configuration: JSON file, CLI overrides, validation.
//!
//! Interval values are duration strings (`"100ms"`, `"5s"`, `"2m"`). When
//! both `--port` and `--endpoints` are passed on the command line the CLI
//! set wins wholesale over the config file.

use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::level_filters::LevelFilter;

use crate::internal::registry::Defaults;
use crate::internal::strategy::{LEAST_CONNECTIONS, RANDOM, ROUND_ROBIN};

pub const MODE_LOCAL: &str = "local";
pub const MODE_REMOTE: &str = "remote";

const STRATEGIES: [&str; 3] = [ROUND_ROBIN, LEAST_CONNECTIONS, RANDOM];
const MODES: [&str; 2] = [MODE_LOCAL, MODE_REMOTE];
const LOG_LEVELS: [&str; 5] = ["none", "debug", "info", "warn", "error"];

/// `Duration` wrapper serialized as a duration string in JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationValue(pub Duration);

impl Serialize for DurationValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(self.0))
    }
}

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_duration(&text)
            .map(DurationValue)
            .map_err(D::Error::custom)
    }
}

impl fmt::Display for DurationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_duration(self.0))
    }
}

/// Parses a single-unit duration string: `250ms`, `5s`, `2m`, `1h`.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let unit_at = text
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| format!("missing unit in duration {text:?}"))?;

    let (number, unit) = text.split_at(unit_at);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration {text:?}"))?;

    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(format!("unknown duration unit {unit:?}")),
    };

    if !seconds.is_finite() || seconds < 0.0 {
        return Err(format!("invalid duration {text:?}"));
    }

    Ok(Duration::from_secs_f64(seconds))
}

fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 != 0 {
        format!("{millis}ms")
    } else {
        format!("{}s", duration.as_secs())
    }
}

/// MongoDB connection settings for `remote` mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Logging level: none, debug, info, warn, error.
    #[serde(default = "default_logging")]
    pub logging: String,

    /// Port the balancer server binds to.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Ordered list of upstream URLs.
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Selection policy: round-robin, least-connections, random.
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Probe cadence per endpoint.
    #[serde(rename = "healthInterval", default = "default_health_interval")]
    pub health_interval: DurationValue,

    /// Limiter sweep cadence.
    #[serde(rename = "refillInterval", default = "default_refill_interval")]
    pub refill_interval: DurationValue,

    /// Budget assigned to lazily-created clients.
    #[serde(default)]
    pub defaults: Defaults,

    /// Registry mode: local file store or remote database.
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Clients file for local mode.
    #[serde(rename = "filePath", default)]
    pub file_path: String,

    /// Database connection for remote mode.
    #[serde(default)]
    pub database: DatabaseConfig,
}

fn default_logging() -> String {
    "error".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_strategy() -> String {
    ROUND_ROBIN.to_string()
}

fn default_health_interval() -> DurationValue {
    DurationValue(Duration::from_secs(5))
}

fn default_refill_interval() -> DurationValue {
    DurationValue(Duration::from_millis(100))
}

fn default_mode() -> String {
    MODE_LOCAL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: default_logging(),
            port: default_port(),
            endpoints: Vec::new(),
            strategy: default_strategy(),
            health_interval: default_health_interval(),
            refill_interval: default_refill_interval(),
            defaults: Defaults::default(),
            mode: default_mode(),
            file_path: String::new(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !LOG_LEVELS.contains(&self.logging.as_str()) {
            bail!("invalid balancer logging level");
        }
        if self.port == 0 {
            bail!("null server port");
        }
        if self.endpoints.is_empty() {
            bail!("list of endpoints is empty");
        }
        if !STRATEGIES.contains(&self.strategy.as_str()) {
            bail!("invalid balancer strategy");
        }
        if self.health_interval.0.is_zero() {
            bail!("null health interval");
        }
        if self.refill_interval.0.is_zero() {
            bail!("null refill interval");
        }
        if self.defaults.capacity == 0 {
            bail!("null default capacity");
        }
        if self.defaults.rate == 0 {
            bail!("null default rate");
        }
        if !MODES.contains(&self.mode.as_str()) {
            bail!("invalid balancer mode");
        }
        if self.mode == MODE_LOCAL && self.file_path.is_empty() {
            bail!("empty file path in local mode");
        }
        if self.mode == MODE_REMOTE && self.database.uri.is_empty() {
            bail!("empty database URI in remote mode");
        }

        Ok(())
    }

    /// Maximum level for the tracing subscriber.
    pub fn log_filter(&self) -> LevelFilter {
        match self.logging.as_str() {
            "none" => LevelFilter::OFF,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" => LevelFilter::WARN,
            _ => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "ballast", about = "HTTP reverse-proxy load balancer")]
pub struct Args {
    /// Path for a config file
    #[arg(long, default_value = "config.json")]
    pub config: String,

    /// Port for the HTTP server
    #[arg(long)]
    pub port: Option<u16>,

    /// List of endpoint URLs in JSON format
    #[arg(long)]
    pub endpoints: Option<String>,

    /// Balancer strategy: round-robin, least-connections, random
    #[arg(long)]
    pub strategy: Option<String>,

    /// Probe interval per endpoint, e.g. "5s"
    #[arg(long)]
    pub health_interval: Option<String>,

    /// Limiter sweep interval, e.g. "100ms"
    #[arg(long)]
    pub refill_interval: Option<String>,

    /// Logging level: none, debug, info, warn, error
    #[arg(long)]
    pub logging: Option<String>,

    /// Registry mode: local or remote
    #[arg(long)]
    pub mode: Option<String>,

    /// Path for the local clients file
    #[arg(long)]
    pub file_path: Option<String>,
}

/// Loads the configuration. A complete CLI set (`--port` plus
/// `--endpoints`) replaces the file; otherwise the file is read as-is.
pub fn load(args: &Args) -> anyhow::Result<Config> {
    if let (Some(port), Some(endpoints)) = (args.port, args.endpoints.as_deref()) {
        let endpoints: Vec<String> =
            serde_json::from_str(endpoints).context("decode endpoints JSON list")?;

        let mut config = Config {
            port,
            endpoints,
            ..Config::default()
        };

        if let Some(strategy) = &args.strategy {
            config.strategy = strategy.clone();
        }
        if let Some(text) = &args.health_interval {
            config.health_interval =
                DurationValue(parse_duration(text).map_err(anyhow::Error::msg)?);
        }
        if let Some(text) = &args.refill_interval {
            config.refill_interval =
                DurationValue(parse_duration(text).map_err(anyhow::Error::msg)?);
        }
        if let Some(logging) = &args.logging {
            config.logging = logging.clone();
        }
        if let Some(mode) = &args.mode {
            config.mode = mode.clone();
        }
        config.file_path = args
            .file_path
            .clone()
            .unwrap_or_else(|| "clients.json".to_string());

        return Ok(config);
    }

    let content = std::fs::read_to_string(&args.config)
        .with_context(|| format!("read config file {}", args.config))?;
    let config: Config = serde_json::from_str(&content).context("decode config file")?;

    Ok(config)
}
