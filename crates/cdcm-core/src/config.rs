use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::util::parse_bool_flag;

/// Every `[metrics.influx]` key, in file order.
pub const INFLUX_KEYS: &[&str] = &[
    "enabled",
    "uri",
    "db",
    "user_name",
    "password",
    "retention_policy",
    "retention_duration",
    "retention_replication_factor",
    "compressed",
    "auto_create_db",
    "consistency",
    "step_secs",
    "num_threads",
    "connect_timeout_ms",
    "read_timeout_ms",
    "batch_size",
];

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Value of the `app` tag on every metric.
    pub app: String,
    pub influx: InfluxConfig,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            app: "cdc".to_string(),
            influx: InfluxConfig::default(),
        }
    }
}

/// Settings of the push backend. Only `enabled` and `step_secs` are read
/// here; the rest is handed through to the publisher untouched.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub enabled: bool,
    pub uri: String,
    pub db: String,
    pub user_name: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub retention_policy: Option<String>,
    pub retention_duration: Option<String>,
    pub retention_replication_factor: Option<u32>,
    pub compressed: bool,
    pub auto_create_db: bool,
    pub consistency: String,
    pub step_secs: u64,
    pub num_threads: usize,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub batch_size: usize,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            uri: "http://localhost:8086".to_string(),
            db: "cdc".to_string(),
            user_name: None,
            password: None,
            retention_policy: None,
            retention_duration: None,
            retention_replication_factor: None,
            compressed: true,
            auto_create_db: true,
            consistency: "one".to_string(),
            step_secs: 60,
            num_threads: 2,
            connect_timeout_ms: 1_000,
            read_timeout_ms: 10_000,
            batch_size: 10_000,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    metrics: MetricsConfig,
}

impl MetricsConfig {
    /// Read `[metrics]` from a TOML file when given, then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Self::from_toml(&content)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => Self::default(),
        };
        cfg.apply_env()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;
        Ok(file.metrics)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(env_lookup)
    }

    /// Overwrite every key `lookup` yields a value for.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(app) = lookup("app") {
            self.app = app;
        }
        let influx = &mut self.influx;
        for &key in INFLUX_KEYS {
            let Some(raw) = lookup(&format!("influx.{key}")) else {
                continue;
            };
            let bad = |what: &str| anyhow!("metrics.influx.{key}: expected {what}, got {raw:?}");
            match key {
                "enabled" => influx.enabled = parse_bool_flag(&raw).ok_or_else(|| bad("a flag"))?,
                "compressed" => {
                    influx.compressed = parse_bool_flag(&raw).ok_or_else(|| bad("a flag"))?
                }
                "auto_create_db" => {
                    influx.auto_create_db = parse_bool_flag(&raw).ok_or_else(|| bad("a flag"))?
                }
                "uri" => influx.uri = raw,
                "db" => influx.db = raw,
                "consistency" => influx.consistency = raw,
                "user_name" => influx.user_name = Some(raw),
                "password" => influx.password = Some(raw),
                "retention_policy" => influx.retention_policy = Some(raw),
                "retention_duration" => influx.retention_duration = Some(raw),
                "retention_replication_factor" => {
                    influx.retention_replication_factor =
                        Some(raw.trim().parse().map_err(|_| bad("an integer"))?)
                }
                "step_secs" => influx.step_secs = raw.trim().parse().map_err(|_| bad("seconds"))?,
                "num_threads" => {
                    influx.num_threads = raw.trim().parse().map_err(|_| bad("an integer"))?
                }
                "connect_timeout_ms" => {
                    influx.connect_timeout_ms =
                        raw.trim().parse().map_err(|_| bad("milliseconds"))?
                }
                "read_timeout_ms" => {
                    influx.read_timeout_ms = raw.trim().parse().map_err(|_| bad("milliseconds"))?
                }
                "batch_size" => {
                    influx.batch_size = raw.trim().parse().map_err(|_| bad("an integer"))?
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Scrape period; never zero.
    pub fn step(&self) -> Duration {
        Duration::from_secs(self.influx.step_secs.max(1))
    }
}

/// `metrics.<key>` first, then `METRICS_<KEY>` with dots folded to `_`.
fn env_lookup(key: &str) -> Option<String> {
    let dotted = format!("metrics.{key}");
    std::env::var(&dotted)
        .ok()
        .or_else(|| std::env::var(dotted.replace('.', "_").to_ascii_uppercase()).ok())
        .filter(|v| !v.trim().is_empty())
}
