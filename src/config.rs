// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::defaults;
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// sqlx URL of the state store
    pub database_url: String,
    /// Root of the resource declarations; only needed by push and diff
    pub monitor_directory: Option<PathBuf>,
    /// Prefix for the labels and annotations stamped on rendered objects
    pub label_namespace: String,
    /// Number of clusters applied or refreshed at the same time
    pub apply_concurrency: usize,
    /// Timeout for every single registry, cluster or store call
    pub operation_timeout: Duration,
    pub registry_retry_attempts: u32,
    /// Registries reached over plain HTTP
    pub insecure_registries: Vec<String>,
    pub registry_credentials: Option<(String, String)>,
    /// Recorded in the audit trail for every state write
    pub actor: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;
        let monitor_directory = env::var("MONITOR_DIRECTORY").ok().map(PathBuf::from);
        let label_namespace = env::var("LABEL_NAMESPACE")
            .unwrap_or_else(|_| defaults::LABEL_NAMESPACE.to_string());

        let apply_concurrency: usize =
            parse_or("APPLY_CONCURRENCY", defaults::APPLY_CONCURRENCY)?;
        anyhow::ensure!(apply_concurrency > 0, "APPLY_CONCURRENCY must be at least 1");
        let timeout_secs: u64 =
            parse_or("OPERATION_TIMEOUT_SECS", defaults::OPERATION_TIMEOUT_SECS)?;
        let registry_retry_attempts: u32 =
            parse_or("REGISTRY_RETRY_ATTEMPTS", defaults::REGISTRY_RETRY_ATTEMPTS)?;

        let insecure_registries = env::var("REGISTRY_INSECURE")
            .map(|v| split_list(&v))
            .unwrap_or_default();
        let registry_credentials = match (env::var("REGISTRY_USERNAME"), env::var("REGISTRY_PASSWORD")) {
            (Ok(user), Ok(password)) => Some((user, password)),
            _ => None,
        };

        let actor = env::var("CONVOY_ACTOR")
            .or_else(|_| env::var("USER"))
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(Config {
            database_url,
            monitor_directory,
            label_namespace,
            apply_concurrency,
            operation_timeout: Duration::from_secs(timeout_secs),
            registry_retry_attempts,
            insecure_registries,
            registry_credentials,
            actor,
        })
    }

    pub fn monitor_directory(&self) -> Result<&PathBuf> {
        self.monitor_directory
            .as_ref()
            .context("MONITOR_DIRECTORY environment variable not set")
    }
}

fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list_trims_and_skips_empty() {
        assert_eq!(
            split_list(" localhost:5000, ,registry.local "),
            vec!["localhost:5000".to_string(), "registry.local".to_string()]
        );
    }

    #[test]
    fn test_split_list_empty() {
        assert!(split_list("").is_empty());
    }
}
