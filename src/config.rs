use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::{Error, Result};

/// Settings of the whole process, read once at start.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Path to a kubeconfig; `None` selects the in-cluster service account.
    pub kubeconfig: Option<PathBuf>,
    pub database: DatabaseSettings,
    pub processor: ProcessorSettings,
    pub server: ServerSettings,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DatabaseSettings {
    /// Path of the SQLite file, or `:memory:`.
    pub path: String,
    pub max_idle: u32,
    pub max_open: u32,
    pub max_lifetime: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProcessorSettings {
    /// Workers per processor.
    pub workers: usize,
    /// Delay before a row that asked for a retry is processed again.
    pub retry_interval: Duration,
    /// Budget after the last status change before a row is failed.
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerSettings {
    pub port: u16,
    pub ops_port: u16,
    pub qps: f64,
    pub burst: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "/var/lib/kappital/kappital.db".into(),
            max_idle: 2,
            max_open: 8,
            max_lifetime: Duration::from_secs(3600),
        }
    }
}

impl DatabaseSettings {
    pub fn in_memory() -> Self {
        Self {
            path: ":memory:".into(),
            ..Default::default()
        }
    }
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            workers: 5,
            retry_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(20 * 60),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 30330,
            ops_port: 8080,
            qps: 10.0,
            burst: 30,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup, falling back to defaults for absent keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database = {
            let defaults = DatabaseSettings::default();
            DatabaseSettings {
                path: get("DATABASE_PATH").unwrap_or(defaults.path),
                max_idle: parse(&get, "DB_MAX_IDLE_CONNS")?.unwrap_or(defaults.max_idle),
                max_open: parse(&get, "DB_MAX_OPEN_CONNS")?
                    .unwrap_or(defaults.max_open)
                    .max(1),
                max_lifetime: parse(&get, "DB_CONN_MAX_LIFETIME_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.max_lifetime),
            }
        };

        let processor = {
            let defaults = ProcessorSettings::default();
            ProcessorSettings {
                workers: parse(&get, "PROCESSOR_WORKERS")?
                    .unwrap_or(defaults.workers)
                    .max(1),
                retry_interval: parse(&get, "PROCESSOR_RETRY_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.retry_interval),
                timeout: parse(&get, "PROCESSOR_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.timeout),
            }
        };

        let server = {
            let defaults = ServerSettings::default();
            ServerSettings {
                port: parse::<i64>(&get, "SERVER_PORT")?
                    .map(clamp_port)
                    .unwrap_or(defaults.port),
                ops_port: parse(&get, "OPS_PORT")?.unwrap_or(defaults.ops_port),
                qps: parse(&get, "RATE_LIMIT_QPS")?.unwrap_or(defaults.qps),
                burst: parse(&get, "RATE_LIMIT_BURST")?.unwrap_or(defaults.burst),
            }
        };

        Ok(Self {
            kubeconfig: get("KubeConfig").or_else(|| get("KUBECONFIG")).map(PathBuf::from),
            database,
            processor,
            server,
        })
    }
}

/// Keep the API port out of the privileged range.
fn clamp_port(port: i64) -> u16 {
    port.clamp(1000, 65535) as u16
}

fn parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| Error::ConfigError(format!("{key} has invalid value {raw:?}")))
        })
        .transpose()
}
