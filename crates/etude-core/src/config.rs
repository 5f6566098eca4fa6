use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::handler::RoutesConfig;
pub use crate::store::BackendConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Server configuration, loaded from a TOML file. Every field has a default
/// so an empty file is a valid configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listen address (default: 0.0.0.0)
    pub host: IpAddr,

    /// Listen port (default: 9006)
    pub port: u16,

    /// Directory static files are served from (default: ./resources)
    pub doc_root: PathBuf,

    /// File served for `/`, relative to `doc_root` (default: judge.html)
    pub default_document: String,

    /// Live client sockets beyond which new connections get 503
    pub max_connections: usize,

    pub workers: WorkersConfig,
    pub timer: TimerConfig,
    pub backend: BackendConfig,
    pub routes: RoutesConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkersConfig {
    /// Worker threads; 0 means one per CPU.
    pub threads: usize,
    /// Work queue bound.
    pub max_requests: usize,
    pub pin_to_cores: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TickSource {
    /// `SIGALRM`, re-armed after every sweep.
    #[default]
    Alarm,
    /// A background thread posting ticks.
    Thread,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TimerConfig {
    /// Interval between idle sweeps, in milliseconds.
    pub timeslot_ms: u64,
    /// Idle time after which a connection is evicted, in milliseconds.
    pub idle_timeout_ms: u64,
    pub tick_source: TickSource,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 9006,
            doc_root: PathBuf::from("./resources"),
            default_document: "judge.html".to_string(),
            max_connections: 65536,
            workers: WorkersConfig::default(),
            timer: TimerConfig::default(),
            backend: BackendConfig::default(),
            routes: RoutesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            max_requests: 10000,
            pin_to_cores: false,
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            timeslot_ms: 5000,
            idle_timeout_ms: 15000,
            tick_source: TickSource::Alarm,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.port == 0 {
            return invalid("port must be non-zero".into());
        }
        if self.max_connections == 0 {
            return invalid("max_connections must be positive".into());
        }
        if self.workers.max_requests == 0 {
            return invalid("workers.max_requests must be positive".into());
        }
        if self.backend.pool_size == 0 {
            return invalid("backend.pool_size must be positive".into());
        }
        if self.timer.timeslot_ms == 0 {
            return invalid("timer.timeslot_ms must be positive".into());
        }
        if self.timer.idle_timeout_ms < self.timer.timeslot_ms {
            return invalid(format!(
                "timer.idle_timeout_ms ({}) is shorter than timer.timeslot_ms ({})",
                self.timer.idle_timeout_ms, self.timer.timeslot_ms
            ));
        }
        if self.default_document.is_empty() || self.default_document.contains('/') {
            return invalid(format!(
                "default_document {:?} must be a bare file name",
                self.default_document
            ));
        }
        for (name, path) in self.routes.paths() {
            if !path.starts_with('/') {
                return invalid(format!("routes.{name} {path:?} must start with '/'"));
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Worker thread count with 0 resolved to the CPU count.
    pub fn worker_threads(&self) -> usize {
        match self.workers.threads {
            0 => num_cpus::get(),
            n => n,
        }
    }

    pub fn timeslot(&self) -> Duration {
        Duration::from_millis(self.timer.timeslot_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.timer.idle_timeout_ms)
    }
}
