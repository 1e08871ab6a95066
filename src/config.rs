use crate::idempotency::CoordinatorConfig;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub redis: RedisSettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    pub application: ApplicationSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub kafka: Option<KafkaSettings>,
}

#[derive(Debug, Deserialize)]
pub struct RedisSettings {
    pub url: String,
}

impl RedisSettings {
    /// `memory://` runs the coordinator on the in-process store.
    pub fn uses_memory_store(&self) -> bool {
        self.url.starts_with("memory://")
    }
}

/// Process-wide idempotency defaults; per-operation policies override them.
#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencySettings {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_expire_time_secs")]
    pub expire_time_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub strong_by_default: bool,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            expire_time_secs: default_expire_time_secs(),
            max_retries: default_max_retries(),
            strong_by_default: false,
        }
    }
}

impl From<&IdempotencySettings> for CoordinatorConfig {
    fn from(settings: &IdempotencySettings) -> Self {
        CoordinatorConfig {
            key_prefix: settings.key_prefix.clone(),
            expire_time: Duration::from_secs(settings.expire_time_secs),
            max_retries: settings.max_retries,
            strong_by_default: settings.strong_by_default,
        }
    }
}

fn default_key_prefix() -> String {
    "idempotent:".to_string()
}

fn default_expire_time_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct KafkaSettings {
    pub brokers: String,
    pub topics: Vec<String>,
    #[serde(default = "default_token_header")]
    pub token_header: String,
}

fn default_token_header() -> String {
    "idempotency-token".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_defaults() {
        let settings = IdempotencySettings::default();
        assert_eq!(settings.key_prefix, "idempotent:");
        assert_eq!(settings.expire_time_secs, 300);
        assert_eq!(settings.max_retries, 3);
        assert!(!settings.strong_by_default);
    }

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [redis]
                url = "redis://localhost:6379"

                [idempotency]
                strong_by_default = true

                [application]
                host = "0.0.0.0"
                port = 8080
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(settings.idempotency.strong_by_default);
        assert_eq!(settings.idempotency.max_retries, 3);
        assert_eq!(settings.logging.level, "info");
        assert!(settings.kafka.is_none());

        let config = CoordinatorConfig::from(&settings.idempotency);
        assert_eq!(config.expire_time, Duration::from_secs(300));
        assert!(config.strong_by_default);
        assert!(!settings.redis.uses_memory_store());
    }

    #[test]
    fn test_kafka_section_defaults_token_header() {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [redis]
                url = "memory://"

                [idempotency]

                [application]
                host = "127.0.0.1"
                port = 3000

                [kafka]
                brokers = "localhost:9092"
                topics = ["orders.commands"]
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(settings.redis.uses_memory_store());
        let kafka = settings.kafka.unwrap();
        assert_eq!(kafka.token_header, "idempotency-token");
        assert_eq!(kafka.topics, vec!["orders.commands".to_string()]);
    }
}
