// Server configuration loaded from environment variables
//
// Everything except DATABASE_URL has a default, so a bare environment runs a
// single-shard server against localhost.

use std::time::Duration;

/// Configuration for the conveyor server
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Bind address for the HTTP surface
    pub bind_addr: Option<String>,
    /// PostgreSQL connection string (required)
    pub database_url: Option<String>,
    /// Base URL of the processing collaborator
    pub collaborator_url: Option<String>,
    /// Prefix for per-phase stage queue names
    pub queue_prefix: Option<String>,
    /// Advisory shard count shared by all consumers
    pub total_shards: Option<u32>,
    /// Whether the background stage consumers run
    pub consumers_enabled: Option<bool>,
    /// Sleep between empty stage polls, in milliseconds
    pub poll_interval_ms: Option<u64>,
    /// Stage message visibility timeout, in milliseconds
    pub visibility_ms: Option<u64>,
    /// Per-invocation worker time budget, in milliseconds
    pub time_budget_ms: Option<u64>,
    /// Per-job dispatch timeout, in milliseconds
    pub dispatch_timeout_ms: Option<u64>,
    /// Job lease duration, in milliseconds
    pub lease_ms: Option<u64>,
    /// Jobs acquired per worker cycle
    pub per_cycle_limit: Option<usize>,
    /// Base delay before a failed publish is retried, in milliseconds
    pub publish_retry_base_ms: Option<u64>,
    /// Cap on the publish retry delay, in milliseconds
    pub publish_retry_max_ms: Option<u64>,
}

impl ServerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("CONVEYOR_BIND_ADDR").ok(),
            database_url: std::env::var("DATABASE_URL").ok(),
            collaborator_url: std::env::var("CONVEYOR_COLLABORATOR_URL").ok(),
            queue_prefix: std::env::var("CONVEYOR_QUEUE_PREFIX").ok(),
            total_shards: parse_var("CONVEYOR_TOTAL_SHARDS"),
            consumers_enabled: parse_var("CONVEYOR_CONSUMERS_ENABLED"),
            poll_interval_ms: parse_var("CONVEYOR_POLL_INTERVAL_MS"),
            visibility_ms: parse_var("CONVEYOR_VISIBILITY_MS"),
            time_budget_ms: parse_var("CONVEYOR_TIME_BUDGET_MS"),
            dispatch_timeout_ms: parse_var("CONVEYOR_DISPATCH_TIMEOUT_MS"),
            lease_ms: parse_var("CONVEYOR_LEASE_MS"),
            per_cycle_limit: parse_var("CONVEYOR_PER_CYCLE_LIMIT"),
            publish_retry_base_ms: parse_var("CONVEYOR_PUBLISH_RETRY_BASE_MS"),
            publish_retry_max_ms: parse_var("CONVEYOR_PUBLISH_RETRY_MAX_MS"),
        }
    }

    /// Get bind address with default
    pub fn bind_addr(&self) -> String {
        self.bind_addr
            .clone()
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
    }

    /// Get collaborator base URL with default
    pub fn collaborator_url(&self) -> String {
        self.collaborator_url
            .clone()
            .unwrap_or_else(|| "http://localhost:9100".to_string())
    }

    /// Get stage queue prefix with default
    pub fn queue_prefix(&self) -> String {
        self.queue_prefix
            .clone()
            .unwrap_or_else(|| "conveyor".to_string())
    }

    /// Get total shard count with default
    pub fn total_shards(&self) -> u32 {
        self.total_shards.unwrap_or(1).max(1)
    }

    /// Whether background consumers run (default true)
    pub fn consumers_enabled(&self) -> bool {
        self.consumers_enabled.unwrap_or(true)
    }

    /// Get the empty-poll sleep with default
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(1_000))
    }

    /// Get the stage visibility timeout with default
    pub fn visibility(&self) -> Duration {
        Duration::from_millis(self.visibility_ms.unwrap_or(300_000))
    }

    /// Get the worker time budget with default
    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms.unwrap_or(55_000))
    }

    /// Get the dispatch timeout with default
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms.unwrap_or(30_000))
    }

    /// Get the job lease duration with default
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms.unwrap_or(120_000))
    }

    /// Get the per-cycle acquisition limit with default
    pub fn per_cycle_limit(&self) -> usize {
        self.per_cycle_limit.unwrap_or(5).max(1)
    }

    /// Get the base publish retry delay with default
    pub fn publish_retry_base(&self) -> Duration {
        Duration::from_millis(self.publish_retry_base_ms.unwrap_or(60_000))
    }

    /// Get the publish retry delay cap with default
    pub fn publish_retry_max(&self) -> Duration {
        Duration::from_millis(self.publish_retry_max_ms.unwrap_or(3_600_000))
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.queue_prefix(), "conveyor");
        assert_eq!(config.total_shards(), 1);
        assert!(config.consumers_enabled());
        assert_eq!(config.per_cycle_limit(), 5);
        assert_eq!(config.time_budget(), Duration::from_millis(55_000));
        assert_eq!(config.publish_retry_base(), Duration::from_millis(60_000));
        assert_eq!(config.publish_retry_max(), Duration::from_millis(3_600_000));
    }

    #[test]
    fn test_explicit_values_win() {
        let config = ServerConfig {
            bind_addr: Some("127.0.0.1:3000".to_string()),
            total_shards: Some(4),
            consumers_enabled: Some(false),
            per_cycle_limit: Some(10),
            ..Default::default()
        };
        assert_eq!(config.bind_addr(), "127.0.0.1:3000");
        assert_eq!(config.total_shards(), 4);
        assert!(!config.consumers_enabled());
        assert_eq!(config.per_cycle_limit(), 10);
    }

    #[test]
    fn test_zero_shards_clamped() {
        let config = ServerConfig {
            total_shards: Some(0),
            ..Default::default()
        };
        assert_eq!(config.total_shards(), 1);
    }
}
