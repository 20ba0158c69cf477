use std::env;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub recompute_workers: usize,
    /// Per-election buffer; subscribers further behind than this skip ahead.
    pub update_stream_capacity: usize,
    pub active_id_attempts: usize,
    /// Seconds a finished or failed recompute job stays visible in job status.
    pub job_retention_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:rcv_engine.db".to_string(),
            database_max_connections: 5,
            recompute_workers: 2,
            update_stream_capacity: 64,
            active_id_attempts: 10,
            job_retention_secs: 500,
        }
    }
}

impl EngineConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            database_max_connections: positive(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            recompute_workers: positive(&lookup, "RECOMPUTE_WORKERS", defaults.recompute_workers)?,
            update_stream_capacity: positive(
                &lookup,
                "UPDATE_STREAM_CAPACITY",
                defaults.update_stream_capacity,
            )?,
            active_id_attempts: positive(&lookup, "ACTIVE_ID_ATTEMPTS", defaults.active_id_attempts)?,
            job_retention_secs: positive(&lookup, "JOB_RETENTION_SECS", defaults.job_retention_secs)?,
        })
    }
}

fn positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    match value.trim().parse::<T>() {
        Ok(parsed) if parsed > T::default() => Ok(parsed),
        _ => Err(ConfigError::Invalid { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn falls_back_to_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.database_url, "sqlite:rcv_engine.db");
        assert_eq!(config.recompute_workers, 2);
        assert_eq!(config.update_stream_capacity, 64);
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("RECOMPUTE_WORKERS", " 4 "),
            ("ACTIVE_ID_ATTEMPTS", "3"),
            ("JOB_RETENTION_SECS", "60"),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.recompute_workers, 4);
        assert_eq!(config.active_id_attempts, 3);
        assert_eq!(config.job_retention_secs, 60);
    }

    #[test]
    fn rejects_zero_and_garbage() {
        assert_eq!(
            EngineConfig::from_lookup(lookup(&[("RECOMPUTE_WORKERS", "0")])).unwrap_err(),
            ConfigError::Invalid {
                key: "RECOMPUTE_WORKERS",
                value: "0".to_string()
            }
        );
        assert!(EngineConfig::from_lookup(lookup(&[("UPDATE_STREAM_CAPACITY", "lots")])).is_err());
    }
}
