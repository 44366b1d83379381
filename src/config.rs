//! Configuration types.
//!
//! Every struct carries its documented defaults in `Default`; `from_env()`
//! overlays `JOB_RELAY_*` environment variables on top.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::broker::BackoffPolicy;
use crate::error::ConfigError;

/// Job manager configuration.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Running jobs silent for longer than this are marked Crashed.
    pub crash_threshold: Duration,
    /// How often the crash sweep runs.
    pub sweep_interval: Duration,
    /// Serialized checkpoint payloads larger than this are rejected.
    pub max_checkpoint_bytes: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            crash_threshold: Duration::from_secs(300), // 5 minutes
            sweep_interval: Duration::from_secs(60),   // 1 minute
            max_checkpoint_bytes: 256 * 1024,
        }
    }
}

/// Which transport the broker bridge runs over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerKind {
    Memory,
    Nats { url: String },
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub backoff: BackoffPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Memory,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Realtime gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_connections: usize,
    pub max_connections_per_owner: usize,
    pub max_rooms_per_connection: usize,
    /// WebSocket ping cadence.
    pub heartbeat_interval: Duration,
    /// Connections that send nothing for this long are closed.
    pub idle_timeout: Duration,
    /// How long an unauthenticated connection may wait before its `auth` frame.
    pub auth_timeout: Duration,
    /// Most recent events replayed on subscribe.
    pub backlog_cap: usize,
    /// Static bearer tokens and the owner each one authenticates as.
    pub tokens: Vec<(SecretString, String)>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_connections_per_owner: 16,
            max_rooms_per_connection: 64,
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            auth_timeout: Duration::from_secs(10),
            backlog_cap: 200,
            tokens: Vec::new(),
        }
    }
}

/// In-process worker runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_parallel_jobs: usize,
    /// How often a running attempt re-reads its job state, catching a
    /// cancel whose live event was lost while the broker was down.
    pub cancel_poll_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 10,
            cancel_poll_interval: Duration::from_secs(2),
        }
    }
}

/// Everything the binary needs.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// When set, logs are also written to a daily-rolling file here.
    pub log_dir: Option<PathBuf>,
    pub jobs: JobConfig,
    pub broker: BrokerConfig,
    pub gateway: GatewayConfig,
    pub runtime: RuntimeConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: PathBuf::from("./data/job-relay.db"),
            log_dir: None,
            jobs: JobConfig::default(),
            broker: BrokerConfig::default(),
            gateway: GatewayConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Build config from `JOB_RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Env { lookup: &lookup };

        let jobs = JobConfig {
            crash_threshold: env.secs(
                "JOB_RELAY_CRASH_THRESHOLD_SECS",
                defaults.jobs.crash_threshold,
            )?,
            sweep_interval: env.secs(
                "JOB_RELAY_SWEEP_INTERVAL_SECS",
                defaults.jobs.sweep_interval,
            )?,
            max_checkpoint_bytes: env.parse(
                "JOB_RELAY_MAX_CHECKPOINT_BYTES",
                defaults.jobs.max_checkpoint_bytes,
            )?,
        };

        let kind = match lookup("JOB_RELAY_BROKER").as_deref().map(str::trim) {
            None | Some("") | Some("memory") => BrokerKind::Memory,
            Some(url) if url.starts_with("nats://") || url.starts_with("tls://") => {
                BrokerKind::Nats {
                    url: url.to_string(),
                }
            }
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "JOB_RELAY_BROKER".to_string(),
                    message: format!("expected `memory` or a nats:// URL, got `{other}`"),
                });
            }
        };
        let backoff = BackoffPolicy::new(
            env.millis("JOB_RELAY_BACKOFF_INITIAL_MS", defaults.broker.backoff.initial)?,
            env.millis("JOB_RELAY_BACKOFF_MAX_MS", defaults.broker.backoff.max)?,
        );

        let gateway = GatewayConfig {
            max_connections: env.parse(
                "JOB_RELAY_MAX_CONNECTIONS",
                defaults.gateway.max_connections,
            )?,
            max_connections_per_owner: env.parse(
                "JOB_RELAY_MAX_CONNECTIONS_PER_OWNER",
                defaults.gateway.max_connections_per_owner,
            )?,
            max_rooms_per_connection: env.parse(
                "JOB_RELAY_MAX_ROOMS_PER_CONNECTION",
                defaults.gateway.max_rooms_per_connection,
            )?,
            heartbeat_interval: env.secs(
                "JOB_RELAY_HEARTBEAT_SECS",
                defaults.gateway.heartbeat_interval,
            )?,
            idle_timeout: env.secs("JOB_RELAY_IDLE_TIMEOUT_SECS", defaults.gateway.idle_timeout)?,
            auth_timeout: defaults.gateway.auth_timeout,
            backlog_cap: env.parse("JOB_RELAY_BACKLOG_CAP", defaults.gateway.backlog_cap)?,
            tokens: parse_tokens(lookup("JOB_RELAY_TOKENS").as_deref().unwrap_or(""))?,
        };

        let runtime = RuntimeConfig {
            max_parallel_jobs: env.parse(
                "JOB_RELAY_MAX_PARALLEL_JOBS",
                defaults.runtime.max_parallel_jobs,
            )?,
            cancel_poll_interval: env.millis(
                "JOB_RELAY_CANCEL_POLL_MS",
                defaults.runtime.cancel_poll_interval,
            )?,
        };

        Ok(Self {
            port: env.parse("JOB_RELAY_PORT", defaults.port)?,
            db_path: lookup("JOB_RELAY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            log_dir: lookup("JOB_RELAY_LOG_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            jobs,
            broker: BrokerConfig { kind, backoff },
            gateway,
            runtime,
        })
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(key) {
            None => Ok(default),
            Some(raw) if raw.trim().is_empty() => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("`{raw}`: {e}"),
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }
}

/// Parse `token:owner,token:owner`.
fn parse_tokens(raw: &str) -> Result<Vec<(SecretString, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((token, owner)) if !token.is_empty() && !owner.trim().is_empty() => Ok((
                SecretString::from(token.to_string()),
                owner.trim().to_string(),
            )),
            _ => Err(ConfigError::InvalidValue {
                key: "JOB_RELAY_TOKENS".to_string(),
                message: "entries must look like `token:owner`".to_string(),
            }),
        })
        .collect()
}
