use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::api::{LeaderboardSort, SortOrder};
use crate::clock::ChartRange;
use crate::ledger::AccountNamespace;

/// Top-level configuration for the minewatch aggregator.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Aggregation API connection configuration.
    #[serde(default)]
    pub api: ApiConfig,

    /// Delta event stream configuration.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Reconciliation scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Identifies this minewatch instance in exported data.
    #[serde(default)]
    pub meta_client_name: String,

    /// Identifies the token network (e.g., mainnet, devnet).
    #[serde(default)]
    pub meta_network_name: String,
}

/// Aggregation API connection configuration.
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    /// API HTTP endpoint (e.g., "http://localhost:4000/v1").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_api_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Delta event stream configuration.
#[derive(Debug, Deserialize)]
pub struct StreamConfig {
    /// Source identifiers to subscribe to (e.g., miner program ids).
    #[serde(default)]
    pub sources: Vec<String>,

    /// Interval between batch flushes toward the scheduler. Default: 500ms.
    #[serde(default = "default_refresh_rate", with = "humantime_serde")]
    pub refresh_rate: Duration,
}

/// Reconciliation scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between authoritative API polls. Default: 30s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Interval between published snapshot refreshes. Default: 500ms.
    #[serde(default = "default_snapshot_interval", with = "humantime_serde")]
    pub snapshot_interval: Duration,

    /// Chart range active at startup. Default: day.
    #[serde(default = "default_range")]
    pub default_range: ChartRange,

    /// Account namespace served at startup. Default: solana.
    #[serde(default = "default_namespace")]
    pub namespace: AccountNamespace,

    /// Optional account whose history is tracked instead of the
    /// network-wide totals.
    #[serde(default)]
    pub account: Option<String>,

    /// Leaderboard page fetch configuration.
    #[serde(default)]
    pub leaderboard: LeaderboardConfig,
}

/// Leaderboard page fetch configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaderboardConfig {
    /// Rows per leaderboard page. Default: 100.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Sort column. Default: rank.
    #[serde(default = "default_sort")]
    pub sort: LeaderboardSort,

    /// Sort direction. Default: asc.
    #[serde(default = "default_order")]
    pub order: SortOrder,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_refresh_rate() -> Duration {
    Duration::from_millis(500)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_snapshot_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_range() -> ChartRange {
    ChartRange::Day
}

fn default_namespace() -> AccountNamespace {
    AccountNamespace::Solana
}

fn default_page_size() -> u32 {
    100
}

fn default_sort() -> LeaderboardSort {
    LeaderboardSort::Rank
}

fn default_order() -> SortOrder {
    SortOrder::Asc
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            api: ApiConfig::default(),
            stream: StreamConfig::default(),
            scheduler: SchedulerConfig::default(),
            health: HealthConfig::default(),
            meta_client_name: String::new(),
            meta_network_name: String::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_api_timeout(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            refresh_rate: default_refresh_rate(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            snapshot_interval: default_snapshot_interval(),
            default_range: default_range(),
            namespace: default_namespace(),
            account: None,
            leaderboard: LeaderboardConfig::default(),
        }
    }
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            sort: default_sort(),
            order: default_order(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.api.endpoint.is_empty() {
            bail!("api.endpoint is required");
        }

        if self.meta_client_name.is_empty() {
            bail!("meta_client_name is required");
        }

        if self.meta_network_name.is_empty() {
            bail!("meta_network_name is required");
        }

        if self.api.timeout.is_zero() {
            bail!("api.timeout must be positive");
        }

        if self.stream.refresh_rate.is_zero() {
            bail!("stream.refresh_rate must be positive");
        }

        for source in &self.stream.sources {
            if source.trim().is_empty() {
                bail!("stream.sources must not contain empty ids");
            }
        }

        if self.scheduler.poll_interval.is_zero() {
            bail!("scheduler.poll_interval must be positive");
        }

        if self.scheduler.snapshot_interval.is_zero() {
            bail!("scheduler.snapshot_interval must be positive");
        }

        if self.scheduler.poll_interval < self.scheduler.snapshot_interval {
            bail!("scheduler.poll_interval must not be shorter than scheduler.snapshot_interval");
        }

        if self.scheduler.leaderboard.page_size == 0 {
            bail!("scheduler.leaderboard.page_size must be positive");
        }

        if let Some(account) = &self.scheduler.account {
            if account.trim().is_empty() {
                bail!("scheduler.account must not be blank when set");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            api: ApiConfig {
                endpoint: "http://localhost:4000/v1".to_string(),
                ..Default::default()
            },
            meta_client_name: "test-node".to_string(),
            meta_network_name: "devnet".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.api.timeout, Duration::from_secs(10));
        assert_eq!(cfg.stream.refresh_rate, Duration::from_millis(500));
        assert_eq!(cfg.scheduler.poll_interval, Duration::from_secs(30));
        assert_eq!(cfg.scheduler.default_range, ChartRange::Day);
        assert_eq!(cfg.scheduler.namespace, AccountNamespace::Solana);
        assert_eq!(cfg.scheduler.leaderboard.page_size, 100);
        assert_eq!(cfg.health.addr, ":9090");
    }

    #[test]
    fn test_parse_yaml_with_overrides() {
        let cfg: Config = serde_yaml::from_str(
            r#"
api:
  endpoint: "http://localhost:4000/v1"
  timeout: 5s
stream:
  sources: ["miner-program-1"]
  refresh_rate: 250ms
scheduler:
  poll_interval: 1m
  default_range: week
  namespace: ethereum
  leaderboard:
    sort: hashRate
    order: desc
meta_client_name: "node-1"
meta_network_name: "mainnet"
"#,
        )
        .expect("valid yaml");

        assert_eq!(cfg.api.timeout, Duration::from_secs(5));
        assert_eq!(cfg.stream.refresh_rate, Duration::from_millis(250));
        assert_eq!(cfg.scheduler.poll_interval, Duration::from_secs(60));
        assert_eq!(cfg.scheduler.default_range, ChartRange::Week);
        assert_eq!(cfg.scheduler.namespace, AccountNamespace::Ethereum);
        assert_eq!(cfg.scheduler.leaderboard.sort, LeaderboardSort::HashRate);
        assert_eq!(cfg.scheduler.leaderboard.order, SortOrder::Desc);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_missing_endpoint() {
        let cfg = Config {
            meta_client_name: "test".to_string(),
            meta_network_name: "devnet".to_string(),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("api.endpoint"));
    }

    #[test]
    fn test_validation_missing_meta_client_name() {
        let cfg = Config {
            api: ApiConfig {
                endpoint: "http://localhost:4000/v1".to_string(),
                ..Default::default()
            },
            meta_network_name: "devnet".to_string(),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("meta_client_name"));
    }

    #[test]
    fn test_validation_empty_source_id() {
        let mut cfg = valid_config();
        cfg.stream.sources = vec!["ok".to_string(), "  ".to_string()];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("stream.sources"));
    }

    #[test]
    fn test_validation_poll_shorter_than_snapshot() {
        let mut cfg = valid_config();
        cfg.scheduler.poll_interval = Duration::from_millis(100);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("poll_interval"));
    }

    #[test]
    fn test_validation_zero_page_size() {
        let mut cfg = valid_config();
        cfg.scheduler.leaderboard.page_size = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("page_size"));
    }

    #[test]
    fn test_validation_blank_tracked_account() {
        let mut cfg = valid_config();
        cfg.scheduler.account = Some(" ".to_string());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("scheduler.account"));
    }
}
