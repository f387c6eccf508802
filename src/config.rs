use crate::tasks::DEFAULT_FLUSH_INTERVAL;
use log::warn;
use std::env;
use std::time::Duration;

pub const STORE_URL_VAR: &str = "ELECTION_STORE_URL";
pub const STORE_KEY_VAR: &str = "ELECTION_STORE_KEY";
pub const FLUSH_INTERVAL_VAR: &str = "ELECTION_FLUSH_INTERVAL_MS";
pub const MAX_CONNECTIONS_VAR: &str = "ELECTION_STORE_MAX_CONNECTIONS";

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone)]
pub struct Config {
    pub store_url: Option<String>,
    pub store_key: Option<String>,
    pub flush_interval: Duration,
    pub max_connections: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url: None,
            store_key: None,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl Config {
    /// Reads the process environment. Nothing here is fatal: missing or bad
    /// values are warned about and replaced by defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let store_url = non_empty(STORE_URL_VAR);
        let store_key = non_empty(STORE_KEY_VAR);
        if store_url.is_none() {
            warn!(
                "{} not found. Set it and {} in the environment or a .env file; vote counts will not be stored.",
                STORE_URL_VAR, STORE_KEY_VAR
            );
        }

        let flush_interval_ms = parse_or_default(non_empty(FLUSH_INTERVAL_VAR), FLUSH_INTERVAL_VAR, DEFAULT_FLUSH_INTERVAL.as_millis() as u64)
            .max(1);
        let max_connections = parse_or_default(non_empty(MAX_CONNECTIONS_VAR), MAX_CONNECTIONS_VAR, DEFAULT_MAX_CONNECTIONS);

        Self {
            store_url,
            store_key,
            flush_interval: Duration::from_millis(flush_interval_ms),
            max_connections,
        }
    }
}

fn parse_or_default<T>(raw: Option<String>, name: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match raw {
        None => default,
        Some(value) => value.parse::<T>().unwrap_or_else(|_| {
            warn!("Ignoring invalid {} value '{}'", name, value);
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn missing_connection_parameters_are_not_fatal() {
        let config = config_from(&[]);
        assert_eq!(config.store_url, None);
        assert_eq!(config.store_key, None);
        assert_eq!(config.flush_interval, Duration::from_secs(1));
        assert_eq!(config.max_connections, 5);
    }

    #[test]
    fn reads_connection_parameters() {
        let config = config_from(&[
            (STORE_URL_VAR, "postgres://observer@db.local/election"),
            (STORE_KEY_VAR, "s3cret"),
            (FLUSH_INTERVAL_VAR, "250"),
        ]);
        assert_eq!(config.store_url.as_deref(), Some("postgres://observer@db.local/election"));
        assert_eq!(config.store_key.as_deref(), Some("s3cret"));
        assert_eq!(config.flush_interval, Duration::from_millis(250));
    }

    #[test]
    fn blank_and_invalid_values_fall_back_to_defaults() {
        let config = config_from(&[(STORE_URL_VAR, "  "), (FLUSH_INTERVAL_VAR, "soon"), (MAX_CONNECTIONS_VAR, "-3")]);
        assert_eq!(config.store_url, None);
        assert_eq!(config.flush_interval, Duration::from_secs(1));
        assert_eq!(config.max_connections, 5);
    }
}
