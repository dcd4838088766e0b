//! Process-wide configuration (spec.md §6 "Environment inputs").
//!
//! Everything here is read once at startup and never mutated afterwards;
//! this is the only place the workspace keeps mutable global state.

use std::{collections::HashSet, env, time::Duration};

use roombus_protocol::{DEFAULT_BYPASS_PROJECTS, IDLE_TIMEOUT_MS, REQUEST_TIMEOUT_MS};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Resolved configuration for a running gateway instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP/WebSocket server binds to.
    pub bind_addr: String,
    /// SQLite connection string backing the credential store, log bucket
    /// store, and usage counters.
    pub database_url: String,
    /// Bearer secret required on `/api-keys` management endpoints. `None`
    /// means the service-key check is not enforced.
    pub service_key: Option<String>,
    /// Project ids that skip API-key validation entirely.
    pub bypass_projects: HashSet<String>,
    /// How long a pending runtime request waits before timing out.
    pub request_timeout: Duration,
    /// How long a Room stays idle before its cleanup alarm fires.
    pub idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8787".to_string(),
            database_url: "sqlite://roombus.db".to_string(),
            service_key: None,
            bypass_projects: DEFAULT_BYPASS_PROJECTS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT_MS),
            idle_timeout: Duration::from_millis(IDLE_TIMEOUT_MS),
        }
    }
}

impl Config {
    /// Load a local `.env` file if present, then resolve from the process
    /// environment. Never fails on a missing file, only on a malformed
    /// numeric override.
    pub fn load() -> Result<Self, Error> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Resolve configuration from the current process environment,
    /// falling back to [`Config::default`] for anything unset.
    pub fn from_env() -> Result<Self, Error> {
        let defaults = Self::default();

        let bind_addr = env::var("BIND_ADDR").unwrap_or(defaults.bind_addr);
        let database_url = env::var("DATABASE_URL").unwrap_or(defaults.database_url);
        let service_key = env::var("SERVICE_KEY").ok().filter(|s| !s.is_empty());

        let bypass_projects = match env::var("BYPASS_PROJECTS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => defaults.bypass_projects,
        };

        let request_timeout = match env::var("REQUEST_TIMEOUT_MS") {
            Ok(raw) => Duration::from_millis(parse_u64("REQUEST_TIMEOUT_MS", &raw)?),
            Err(_) => defaults.request_timeout,
        };

        let idle_timeout = match env::var("IDLE_TIMEOUT_MS") {
            Ok(raw) => Duration::from_millis(parse_u64("IDLE_TIMEOUT_MS", &raw)?),
            Err(_) => defaults.idle_timeout,
        };

        Ok(Self {
            bind_addr,
            database_url,
            service_key,
            bypass_projects,
            request_timeout,
            idle_timeout,
        })
    }

    /// Whether `project_id` may connect without a valid API key.
    pub fn bypasses_key_check(&self, project_id: &str) -> bool {
        self.bypass_projects.contains(project_id)
    }
}

fn parse_u64(var: &'static str, value: &str) -> Result<u64, Error> {
    value.parse().map_err(|_| Error::InvalidValue {
        var,
        value: value.to_string(),
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_demo_bypass_projects() {
        let cfg = Config::default();
        assert!(cfg.bypasses_key_check("demo"));
        assert!(cfg.bypasses_key_check("demo-prod"));
        assert!(!cfg.bypasses_key_check("acme-corp"));
    }

    #[test]
    fn parse_u64_rejects_garbage() {
        let err = parse_u64("REQUEST_TIMEOUT_MS", "not-a-number").unwrap_err();
        assert!(matches!(err, Error::InvalidValue { var: "REQUEST_TIMEOUT_MS", .. }));
    }
}
