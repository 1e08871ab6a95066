use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer, Registry,
};

/// Chatty dependencies held at `warn` unless `RUST_LOG` overrides them.
const QUIET_TARGETS: &[&str] = &["rskafka", "hyper", "h2", "tower_http"];

/// Output format, from the `logging.format` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    /// One JSON object per event, with span close timings.
    Json,
    Compact,
}

impl From<&str> for LogFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
    pub include_location: bool,
}

impl LogConfig {
    pub fn new(level: impl Into<String>, format: &str) -> Self {
        Self {
            level: level.into(),
            format: LogFormat::from(format),
            ..Self::default()
        }
    }

    /// `RUST_LOG` wins; otherwise `level` with the quiet targets appended.
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.directives()))
    }

    fn directives(&self) -> String {
        QUIET_TARGETS.iter().fold(self.level.clone(), |acc, target| {
            format!("{},{}=warn", acc, target)
        })
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = fmt::layer()
            .with_target(self.include_target)
            .with_file(self.include_location)
            .with_line_number(self.include_location);

        match self.format {
            LogFormat::Json => layer.json().with_span_events(FmtSpan::CLOSE).boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
            include_location: false,
        }
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(config.filter())
        .try_init()?;

    tracing::info!(level = %config.level, format = ?config.format, "Logging initialized");
    Ok(())
}

/// Keeps `visible_chars` characters at each end and stars out the rest.
/// Values too short to keep both ends are hidden entirely.
pub fn mask_sensitive(value: &str, visible_chars: usize) -> String {
    let len = value.chars().count();
    if len <= visible_chars * 2 {
        return "*".repeat(len);
    }

    value
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if i < visible_chars || i >= len - visible_chars {
                c
            } else {
                '*'
            }
        })
        .collect()
}

/// Idempotency tokens are logged with four characters kept at each end.
pub fn mask_token(token: &str) -> String {
    mask_sensitive(token, 4)
}
