use once_cell::sync::OnceCell;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

use cdcm_core::util::parse_bool_flag;

/// Log target carrying metrics lifecycle and published batches.
pub const METRICS_TARGET: &str = "cdcm.metrics";

static INSTALLED: OnceCell<()> = OnceCell::new();
static METRICS_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
}

impl Rotation {
    /// Unknown values fall back to daily.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hourly" => Rotation::Hourly,
            "minutely" => Rotation::Minutely,
            _ => Rotation::Daily,
        }
    }

    fn appender(self, dir: &str, prefix: &str) -> RollingFileAppender {
        match self {
            Rotation::Minutely => tracing_appender::rolling::minutely(dir, prefix),
            Rotation::Hourly => tracing_appender::rolling::hourly(dir, prefix),
            Rotation::Daily => tracing_appender::rolling::daily(dir, prefix),
        }
    }
}

/// Where the `cdcm.metrics` target is additionally written, if anywhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogOptions {
    pub roll: bool,
    pub dir: String,
    pub prefix: String,
    pub rotation: Rotation,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            roll: false,
            dir: "logs".to_string(),
            prefix: "cdc-metrics".to_string(),
            rotation: Rotation::Daily,
        }
    }
}

impl LogOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            roll: lookup("CDCM_LOG_ROLL")
                .and_then(|raw| parse_bool_flag(&raw))
                .unwrap_or(defaults.roll),
            dir: lookup("CDCM_LOG_DIR").unwrap_or(defaults.dir),
            prefix: lookup("CDCM_LOG_PREFIX").unwrap_or(defaults.prefix),
            rotation: lookup("CDCM_LOG_ROTATION")
                .map(|raw| Rotation::parse(&raw))
                .unwrap_or(defaults.rotation),
        }
    }
}

/// Install the process-wide subscriber from the environment. Later calls
/// are no-ops.
pub fn init() {
    init_with(LogOptions::from_env());
}

pub fn init_with(options: LogOptions) {
    INSTALLED.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        install(filter, &options);
    });
}

fn install(filter: EnvFilter, options: &LogOptions) {
    let registry = tracing_subscriber::registry().with(fmt::layer().with_filter(filter));
    if !options.roll {
        let _ = registry.try_init();
        return;
    }

    if std::fs::create_dir_all(&options.dir).is_err() {
        tracing::warn!(directory = %options.dir, "failed to create metrics log directory");
    }
    let writer = options.rotation.appender(&options.dir, &options.prefix);
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = METRICS_GUARD.set(guard);
    let targets = Targets::new().with_target(METRICS_TARGET, tracing::Level::DEBUG);
    let metrics_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(nb)
        .with_filter(targets);
    let _ = registry.with(metrics_layer).try_init();
}
