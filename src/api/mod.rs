use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::clock::BucketUnit;
use crate::config::ApiConfig;
use crate::ledger::{AccountNamespace, LedgerEntry};

mod lenient;

/// Aggregation API error. Transient transport failures and unexpected
/// statuses are retried by the caller on its next poll tick; nothing
/// here is fatal.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("requesting {endpoint}: {source}")]
    Transport {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected status {status} from {endpoint}: {message}")]
    Status {
        endpoint: &'static str,
        status: u16,
        message: String,
    },

    #[error("decoding {endpoint} response: {source}")]
    Decode {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("building HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Leaderboard sort key, in the API's query-string spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LeaderboardSort {
    Rank,
    Hashes,
    SuperHashes,
    HashRate,
    SolXen,
}

impl LeaderboardSort {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rank => "rank",
            Self::Hashes => "hashes",
            Self::SuperHashes => "superHashes",
            Self::HashRate => "hashRate",
            Self::SolXen => "solXen",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// Parameters of one leaderboard page fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderboardQuery {
    pub namespace: AccountNamespace,
    pub limit: u32,
    pub offset: u32,
    pub sort: LeaderboardSort,
    pub order: SortOrder,
}

impl Default for LeaderboardQuery {
    fn default() -> Self {
        Self {
            namespace: AccountNamespace::Solana,
            limit: 100,
            offset: 0,
            sort: LeaderboardSort::Rank,
            order: SortOrder::Asc,
        }
    }
}

/// Network-wide totals returned by `GET /state`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalState {
    #[serde(deserialize_with = "lenient::u128_or_default")]
    pub points: u128,
    #[serde(deserialize_with = "lenient::u128_or_default")]
    pub sol_xen: u128,
    #[serde(deserialize_with = "lenient::u64_or_default")]
    pub hashes: u64,
    #[serde(deserialize_with = "lenient::u64_or_default")]
    pub super_hashes: u64,
    #[serde(deserialize_with = "lenient::u64_or_default")]
    pub txs: u64,
    #[serde(deserialize_with = "lenient::f64_or_default")]
    pub hash_rate: f64,
    #[serde(deserialize_with = "lenient::u64_or_default")]
    pub amp: u64,
    #[serde(deserialize_with = "lenient::u64_or_default")]
    pub last_amp_slot: u64,
    #[serde(deserialize_with = "lenient::f64_or_default")]
    pub avg_priority_fee: f64,
    pub created_at: Option<DateTime<Utc>>,
}

/// One completed bucket of per-metric deltas from a history endpoint.
/// Each field is the authoritative increment over the bucket, not a
/// running total.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryPoint {
    pub created_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "lenient::i64_or_default")]
    pub hashes_delta: i64,
    #[serde(deserialize_with = "lenient::i64_or_default")]
    pub super_hashes_delta: i64,
    #[serde(deserialize_with = "lenient::u128_opt")]
    pub sol_xen_delta: Option<u128>,
}

/// One leaderboard row as the API serializes it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LeaderboardRow {
    #[serde(deserialize_with = "lenient::u64_or_default")]
    rank: u64,
    account: String,
    #[serde(deserialize_with = "lenient::u64_or_default")]
    hashes: u64,
    #[serde(deserialize_with = "lenient::u64_or_default")]
    super_hashes: u64,
    #[serde(deserialize_with = "lenient::u128_or_default")]
    points: u128,
    #[serde(deserialize_with = "lenient::u128_or_default")]
    sol_xen: u128,
    #[serde(deserialize_with = "lenient::f64_or_default")]
    hash_rate: f64,
    last_active: Option<DateTime<Utc>>,
}

impl From<LeaderboardRow> for LedgerEntry {
    fn from(row: LeaderboardRow) -> Self {
        Self {
            account: row.account,
            rank: u32::try_from(row.rank).unwrap_or(u32::MAX),
            hashes: row.hashes,
            super_hashes: row.super_hashes,
            points: row.points,
            sol_xen: row.sol_xen,
            hash_rate: row.hash_rate,
            last_active: row.last_active,
        }
    }
}

/// Callback type for recording API request metrics:
/// (endpoint_name, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Read-only aggregation API consumed by the scheduler.
pub trait StatsApi: Send + Sync {
    /// Fetch one page of the ranked leaderboard.
    fn fetch_leaderboard(
        &self,
        query: &LeaderboardQuery,
    ) -> impl std::future::Future<Output = Result<Vec<LedgerEntry>, ApiError>> + Send;

    /// Fetch network-wide totals.
    fn fetch_global_state(
        &self,
    ) -> impl std::future::Future<Output = Result<GlobalState, ApiError>> + Send;

    /// Fetch network-wide bucketed deltas over `[from, to)`.
    fn fetch_state_history(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        unit: BucketUnit,
    ) -> impl std::future::Future<Output = Result<Vec<HistoryPoint>, ApiError>> + Send;

    /// Fetch one account's bucketed deltas over `[from, to)`. The
    /// account's namespace picks the endpoint.
    fn fetch_account_history(
        &self,
        account: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        unit: BucketUnit,
    ) -> impl std::future::Future<Output = Result<Vec<HistoryPoint>, ApiError>> + Send;
}

/// HTTP client for the aggregation API.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    metrics: Option<MetricsCallback>,
}

impl Client {
    pub fn new(cfg: &ApiConfig) -> Result<Self, ApiError> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, endpoint: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(endpoint, status, duration);
        }
    }

    /// Perform a GET request and deserialize the JSON response.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &'static str,
        path_and_query: &str,
    ) -> Result<T, ApiError> {
        let start = Instant::now();
        let url = format!("{}{}", self.endpoint, path_and_query);

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|source| {
                self.record_request(endpoint, "error", start.elapsed());
                ApiError::Transport { endpoint, source }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            self.record_request(endpoint, "error", start.elapsed());
            return Err(ApiError::Status {
                endpoint,
                status: status.as_u16(),
                message,
            });
        }

        let result = response.json().await.map_err(|source| {
            self.record_request(endpoint, "error", start.elapsed());
            ApiError::Decode { endpoint, source }
        })?;

        self.record_request(endpoint, "success", start.elapsed());

        Ok(result)
    }
}

impl StatsApi for Client {
    async fn fetch_leaderboard(
        &self,
        query: &LeaderboardQuery,
    ) -> Result<Vec<LedgerEntry>, ApiError> {
        debug!(
            namespace = query.namespace.as_str(),
            limit = query.limit,
            offset = query.offset,
            "fetching leaderboard",
        );

        let path = format!(
            "/leaderboard?account={}&limit={}&offset={}&sort={}&order={}",
            query.namespace.as_str(),
            query.limit,
            query.offset,
            query.sort.as_str(),
            query.order.as_str(),
        );

        let rows: Vec<LeaderboardRow> = self.get_json("leaderboard", &path).await?;
        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    async fn fetch_global_state(&self) -> Result<GlobalState, ApiError> {
        debug!("fetching global state");
        self.get_json("state", "/state").await
    }

    async fn fetch_state_history(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        unit: BucketUnit,
    ) -> Result<Vec<HistoryPoint>, ApiError> {
        debug!(%from, %to, %unit, "fetching state history");

        let path = format!(
            "/state/history?from={}&to={}&unit={}",
            from.to_rfc3339(),
            to.to_rfc3339(),
            unit.as_str(),
        );
        self.get_json("state_history", &path).await
    }

    async fn fetch_account_history(
        &self,
        account: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        unit: BucketUnit,
    ) -> Result<Vec<HistoryPoint>, ApiError> {
        debug!(account, %from, %to, %unit, "fetching account history");

        let collection = match AccountNamespace::of(account) {
            AccountNamespace::Ethereum => "eth_accounts",
            AccountNamespace::Solana => "sol_accounts",
        };
        let path = format!(
            "/{collection}/{account}/state/history?from={}&to={}&unit={}",
            from.to_rfc3339(),
            to.to_rfc3339(),
            unit.as_str(),
        );
        self.get_json("account_history", &path).await
    }
}
