//! Service configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use messaging::OffsetReset;
use saga::{ConsumerConfig, PublisherConfig, SagaConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("{0} is required")]
    Missing(&'static str),
}

/// Deployment environment; selects the log format and default level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Local,
    Dev,
    Prod,
}

impl AppEnv {
    pub fn default_log_level(&self) -> &'static str {
        match self {
            AppEnv::Local => "debug",
            AppEnv::Dev | AppEnv::Prod => "info",
        }
    }

    /// Whether logs are emitted as JSON lines.
    pub fn json_logs(&self) -> bool {
        !matches!(self, AppEnv::Local)
    }
}

impl FromStr for AppEnv {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(AppEnv::Local),
            "dev" | "development" => Ok(AppEnv::Dev),
            "prod" | "production" => Ok(AppEnv::Prod),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres {
        url: String,
        max_connections: u32,
    },
}

impl StoreBackend {
    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusBackend {
    Memory,
    Nats { url: String },
}

impl BusBackend {
    pub fn name(&self) -> &'static str {
        match self {
            BusBackend::Memory => "memory",
            BusBackend::Nats { .. } => "nats",
        }
    }
}

/// Service configuration.
///
/// Every setting has a default except the connection URL of a selected
/// external backend (`DATABASE_URL` for postgres, `NATS_URL` for nats).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub app_env: AppEnv,
    pub log_level: String,
    pub saga: SagaConfig,
    pub publisher: PublisherConfig,
    pub consumer: ConsumerConfig,
    pub store: StoreBackend,
    pub bus: BusBackend,
    pub bus_partitions: u32,
    pub redelivery_delay: Duration,
    pub shutdown_grace: Duration,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from `lookup`, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = Config::default();

        let app_env = match env.raw("APP_ENV") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "APP_ENV",
                value,
            })?,
            None => defaults.app_env,
        };
        let log_level = env
            .raw("RUST_LOG")
            .unwrap_or_else(|| app_env.default_log_level().to_string());

        let saga = SagaConfig {
            timeout: env.secs("SAGA_TIMEOUT_SECS", defaults.saga.timeout)?,
            retry_interval: env.millis("SAGA_RETRY_INTERVAL_MS", defaults.saga.retry_interval)?,
            max_retries: env.parse("SAGA_MAX_RETRIES", defaults.saga.max_retries)?,
            cleanup_interval: env.secs("SAGA_CLEANUP_INTERVAL_SECS", defaults.saga.cleanup_interval)?,
            retention: env.secs("SAGA_RETENTION_SECS", defaults.saga.retention)?,
            step_timeout: env.secs("STEP_TIMEOUT_SECS", defaults.saga.step_timeout)?,
            scan_page_size: defaults.saga.scan_page_size,
        };
        if saga.cleanup_interval.is_zero() {
            return Err(ConfigError::Invalid {
                name: "SAGA_CLEANUP_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }

        let publisher = PublisherConfig {
            max_retries: env.parse("PUBLISH_MAX_RETRIES", defaults.publisher.max_retries)?,
            initial_backoff: env.millis(
                "PUBLISH_INITIAL_BACKOFF_MS",
                defaults.publisher.initial_backoff,
            )?,
            max_backoff: env.millis("PUBLISH_MAX_BACKOFF_MS", defaults.publisher.max_backoff)?,
        };

        let consumer = ConsumerConfig {
            group_id: env
                .raw("CONSUMER_GROUP_ID")
                .unwrap_or(defaults.consumer.group_id),
            max_processing_time: env.millis(
                "CONSUMER_MAX_PROCESSING_MS",
                defaults.consumer.max_processing_time,
            )?,
            offset_reset: env.parse("CONSUMER_OFFSET_RESET", defaults.consumer.offset_reset)?,
            error_backoff: defaults.consumer.error_backoff,
        };

        let store = match env.raw("STORE_BACKEND").as_deref() {
            None | Some("memory") => StoreBackend::Memory,
            Some("postgres") => StoreBackend::Postgres {
                url: env
                    .raw("DATABASE_URL")
                    .ok_or(ConfigError::Missing("DATABASE_URL"))?,
                max_connections: env.parse("DATABASE_MAX_CONNECTIONS", 10)?,
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "STORE_BACKEND",
                    value: other.to_string(),
                });
            }
        };

        let bus = match env.raw("BUS_BACKEND").as_deref() {
            None | Some("memory") => BusBackend::Memory,
            Some("nats") => BusBackend::Nats {
                url: env.raw("NATS_URL").ok_or(ConfigError::Missing("NATS_URL"))?,
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "BUS_BACKEND",
                    value: other.to_string(),
                });
            }
        };

        Ok(Self {
            host: env.raw("HOST").unwrap_or(defaults.host),
            port: env.parse("PORT", defaults.port)?,
            app_env,
            log_level,
            saga,
            publisher,
            consumer,
            store,
            bus,
            bus_partitions: env.parse("BUS_PARTITIONS", defaults.bus_partitions)?,
            redelivery_delay: env.millis("BUS_REDELIVERY_DELAY_MS", defaults.redelivery_delay)?,
            shutdown_grace: env.secs("SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            app_env: AppEnv::Prod,
            log_level: "info".to_string(),
            saga: SagaConfig::default(),
            publisher: PublisherConfig::default(),
            consumer: ConsumerConfig::default(),
            store: StoreBackend::Memory,
            bus: BusBackend::Memory,
            bus_partitions: 4,
            redelivery_delay: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError> {
        match self.raw(name) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { name, value }),
            None => Ok(default),
        }
    }

    fn secs(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(name, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(name, default).map(Duration::from_millis)
    }
}
