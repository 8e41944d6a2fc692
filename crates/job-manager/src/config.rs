//! Service configuration, read from environment variables.

use std::{path::PathBuf, str::FromStr};

use error_stack::{Report, ResultExt};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("Invalid configuration value for {0}")]
pub struct ConfigError(pub &'static str);

/// Where completed artifacts are copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationConfig {
    pub bucket: String,
    /// If not set, the region comes from the default AWS configuration.
    pub region: Option<String>,
    /// Prepended to each artifact's file name to form its object key.
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    /// The Redis URL to use for the queue. If absent, an in-process queue is used.
    pub queue_url: Option<String>,
    pub queue_name: String,
    pub upload_dir: PathBuf,
    pub work_dir: PathBuf,
    pub num_workers: usize,
    pub replication: Option<ReplicationConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://marketsight.db".to_string(),
            queue_url: None,
            queue_name: "training_jobs".to_string(),
            upload_dir: PathBuf::from("uploads"),
            work_dir: PathBuf::from("models"),
            num_workers: 2,
            replication: None,
        }
    }
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, Report<ConfigError>> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration using `lookup` to find each variable. Empty values are treated
    /// the same as unset ones.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, Report<ConfigError>> {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let queue_url = get("MARKETSIGHT_QUEUE_URL")
            .or_else(|| get("REDIS_HOST").map(|host| format!("redis://{host}:6379")));

        let num_workers = parse_var(&get, "MARKETSIGHT_WORKERS")?.unwrap_or(defaults.num_workers);
        if num_workers == 0 {
            return Err(Report::new(ConfigError("MARKETSIGHT_WORKERS"))
                .attach_printable("At least one worker is required"));
        }

        let replication = get("ARTIFACT_BUCKET").map(|bucket| ReplicationConfig {
            bucket,
            region: get("ARTIFACT_REGION"),
            prefix: get("ARTIFACT_PREFIX").unwrap_or_default(),
        });

        Ok(Self {
            database_url: get("MARKETSIGHT_DATABASE_URL").unwrap_or(defaults.database_url),
            queue_url,
            queue_name: get("MARKETSIGHT_QUEUE_NAME").unwrap_or(defaults.queue_name),
            upload_dir: get("MARKETSIGHT_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            work_dir: get("MARKETSIGHT_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            num_workers,
            replication,
        })
    }
}

fn parse_var<T: FromStr>(
    get: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, Report<ConfigError>> {
    get(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| Report::new(ConfigError(name)))
                .attach_printable_lazy(|| format!("Value: {value:?}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, Report<ConfigError>> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        assert_eq!(load(&[]).unwrap(), Config::default());
    }

    #[test]
    fn overrides() {
        let config = load(&[
            ("MARKETSIGHT_DATABASE_URL", "sqlite::memory:"),
            ("MARKETSIGHT_QUEUE_URL", "redis://queue:6380"),
            ("MARKETSIGHT_QUEUE_NAME", "jobs"),
            ("MARKETSIGHT_UPLOAD_DIR", "/data/uploads"),
            ("MARKETSIGHT_WORK_DIR", "/data/models"),
            ("MARKETSIGHT_WORKERS", " 8 "),
        ])
        .unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.queue_url.as_deref(), Some("redis://queue:6380"));
        assert_eq!(config.queue_name, "jobs");
        assert_eq!(config.upload_dir, PathBuf::from("/data/uploads"));
        assert_eq!(config.work_dir, PathBuf::from("/data/models"));
        assert_eq!(config.num_workers, 8);
        assert_eq!(config.replication, None);
    }

    #[test]
    fn redis_host_fallback() {
        let config = load(&[("REDIS_HOST", "cache")]).unwrap();
        assert_eq!(config.queue_url.as_deref(), Some("redis://cache:6379"));

        let config = load(&[
            ("REDIS_HOST", "cache"),
            ("MARKETSIGHT_QUEUE_URL", "redis://other:6379"),
        ])
        .unwrap();
        assert_eq!(config.queue_url.as_deref(), Some("redis://other:6379"));
    }

    #[test]
    fn replication() {
        let config = load(&[("ARTIFACT_BUCKET", "models-bucket")]).unwrap();
        assert_eq!(
            config.replication,
            Some(ReplicationConfig {
                bucket: "models-bucket".to_string(),
                region: None,
                prefix: String::new(),
            })
        );

        let config = load(&[
            ("ARTIFACT_BUCKET", "models-bucket"),
            ("ARTIFACT_REGION", "eu-west-1"),
            ("ARTIFACT_PREFIX", "trained/"),
        ])
        .unwrap();
        let replication = config.replication.unwrap();
        assert_eq!(replication.region.as_deref(), Some("eu-west-1"));
        assert_eq!(replication.prefix, "trained/");

        // Region alone does nothing.
        let config = load(&[("ARTIFACT_REGION", "eu-west-1")]).unwrap();
        assert_eq!(config.replication, None);
    }

    #[test]
    fn empty_values_are_unset() {
        let config = load(&[("ARTIFACT_BUCKET", ""), ("MARKETSIGHT_WORKERS", "  ")]).unwrap();
        assert_eq!(config.replication, None);
        assert_eq!(config.num_workers, 2);
    }

    #[test]
    fn invalid_worker_count() {
        let err = load(&[("MARKETSIGHT_WORKERS", "many")]).unwrap_err();
        assert_eq!(err.current_context().0, "MARKETSIGHT_WORKERS");

        let err = load(&[("MARKETSIGHT_WORKERS", "0")]).unwrap_err();
        assert_eq!(err.current_context().0, "MARKETSIGHT_WORKERS");
    }
}
