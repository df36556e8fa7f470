use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::{info, warn};

/// Server settings, read once from `CAMPUSD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Shared password every campus user logs in with.
    pub password: String,
    pub max_connections: usize,
    /// WAL appends after which a campus log is compacted.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Admin account created in every new, empty campus.
    pub admin_user: String,
    pub seed_sample_data: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "campusd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            admin_user: "admin".into(),
            seed_sample_data: false,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: try_load(&lookup, "CAMPUSD_PORT", defaults.port),
            bind: lookup("CAMPUSD_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("CAMPUSD_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("CAMPUSD_PASSWORD").unwrap_or_else(|| {
                warn!("CAMPUSD_PASSWORD not set, using the built-in default");
                defaults.password
            }),
            max_connections: try_load(&lookup, "CAMPUSD_MAX_CONNECTIONS", defaults.max_connections),
            compact_threshold: try_load(&lookup, "CAMPUSD_COMPACT_THRESHOLD", defaults.compact_threshold),
            metrics_port: try_load_optional(&lookup, "CAMPUSD_METRICS_PORT"),
            tls_cert: lookup("CAMPUSD_TLS_CERT"),
            tls_key: lookup("CAMPUSD_TLS_KEY"),
            admin_user: lookup("CAMPUSD_ADMIN_USER").unwrap_or(defaults.admin_user),
            seed_sample_data: try_load(&lookup, "CAMPUSD_SEED_SAMPLE_DATA", defaults.seed_sample_data),
        }
    }
}

fn try_load<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Some(raw) = lookup(key) else {
        info!("{key} not set, using default: {default}");
        return default;
    };
    raw.trim().parse().unwrap_or_else(|e| {
        warn!("Invalid {key} value {raw:?} ({e}), using default: {default}");
        default
    })
}

fn try_load_optional<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = lookup(key)?;
    raw.trim()
        .parse()
        .map_err(|e| warn!("Invalid {key} value {raw:?} ({e}), ignoring"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(load(&[]), Config::default());
    }

    #[test]
    fn values_are_read() {
        let config = load(&[
            ("CAMPUSD_PORT", "6000"),
            ("CAMPUSD_DATA_DIR", "/var/lib/campusd"),
            ("CAMPUSD_METRICS_PORT", "9100"),
            ("CAMPUSD_ADMIN_USER", "root"),
            ("CAMPUSD_SEED_SAMPLE_DATA", "true"),
        ]);
        assert_eq!(config.port, 6000);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/campusd"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.admin_user, "root");
        assert!(config.seed_sample_data);
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = load(&[
            ("CAMPUSD_PORT", "not-a-port"),
            ("CAMPUSD_MAX_CONNECTIONS", "-1"),
            ("CAMPUSD_METRICS_PORT", "99999"),
        ]);
        assert_eq!(config.port, 5433);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.metrics_port, None);
    }
}
