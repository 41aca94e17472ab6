use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{
    ApiError, GlobalState, HistoryPoint, LeaderboardQuery, LeaderboardSort, SortOrder, StatsApi,
};
use crate::clock::{unix_now, BucketUnit, ChartRange};
use crate::config::SchedulerConfig;
use crate::export::health::HealthMetrics;
use crate::ledger::{AccountNamespace, LeaderboardLedger, LedgerEntry};
use crate::stream::{DeltaEvent, SOL_XEN_DECIMALS};
use crate::aggregator::{MetricKind, SeriesPoint, TimeBucketAggregator};

/// Capacity of the scheduler command channel.
const COMMAND_BUFFER: usize = 1024;

/// Capacity of the poll outcome channel. Polls are spawned one per
/// tick or query change, so this never fills in practice.
const POLL_BUFFER: usize = 8;

/// Commands accepted by the scheduler task. All external mutation of
/// aggregation state goes through this channel; the task owns the
/// aggregators and the ledger outright.
#[derive(Debug)]
pub enum Command {
    /// Switch the chart range. Clears bucket state and triggers an
    /// immediate fresh fetch; results of in-flight polls for the old
    /// range are discarded on arrival.
    SetRange(ChartRange),
    /// Track one account's history instead of network-wide totals, or
    /// `None` to go back to the network view.
    SetAccount(Option<String>),
    /// Switch the leaderboard namespace. Entries of the old namespace
    /// are dropped immediately rather than served mislabeled.
    SetNamespace(AccountNamespace),
    /// Change the leaderboard page or ordering.
    SetPage {
        offset: u32,
        sort: LeaderboardSort,
        order: SortOrder,
    },
    /// A flushed batch of live delta events.
    Deltas(Vec<DeltaEvent>),
}

/// Published chart state: one time-ascending series per metric, all
/// from the same range/granularity.
#[derive(Debug, Clone)]
pub struct ChartSnapshot {
    pub range: ChartRange,
    pub hashes: Vec<SeriesPoint>,
    pub super_hashes: Vec<SeriesPoint>,
    pub sol_xen: Vec<SeriesPoint>,
}

impl ChartSnapshot {
    fn empty(range: ChartRange) -> Self {
        Self {
            range,
            hashes: Vec::new(),
            super_hashes: Vec::new(),
            sol_xen: Vec::new(),
        }
    }

    pub fn series(&self, kind: MetricKind) -> &[SeriesPoint] {
        match kind {
            MetricKind::Hashes => &self.hashes,
            MetricKind::SuperHashes => &self.super_hashes,
            MetricKind::SolXen => &self.sol_xen,
        }
    }
}

/// Published leaderboard state.
#[derive(Debug, Clone)]
pub struct LedgerView {
    pub namespace: AccountNamespace,
    pub entries: Vec<LedgerEntry>,
}

/// Cheaply cloneable handle for feeding commands in and reading
/// published state out.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    chart: watch::Receiver<ChartSnapshot>,
    ledger: watch::Receiver<LedgerView>,
    state: watch::Receiver<GlobalState>,
}

impl SchedulerHandle {
    pub async fn set_range(&self, range: ChartRange) {
        let _ = self.commands.send(Command::SetRange(range)).await;
    }

    pub async fn set_account(&self, account: Option<String>) {
        let _ = self.commands.send(Command::SetAccount(account)).await;
    }

    pub async fn set_namespace(&self, namespace: AccountNamespace) {
        let _ = self.commands.send(Command::SetNamespace(namespace)).await;
    }

    pub async fn set_page(&self, offset: u32, sort: LeaderboardSort, order: SortOrder) {
        let _ = self
            .commands
            .send(Command::SetPage {
                offset,
                sort,
                order,
            })
            .await;
    }

    /// Raw command sender, for wiring the batcher flush handler.
    pub fn commands(&self) -> mpsc::Sender<Command> {
        self.commands.clone()
    }

    pub fn chart(&self) -> watch::Receiver<ChartSnapshot> {
        self.chart.clone()
    }

    pub fn ledger(&self) -> watch::Receiver<LedgerView> {
        self.ledger.clone()
    }

    /// Network-wide totals from the most recent successful poll.
    pub fn state(&self) -> watch::Receiver<GlobalState> {
        self.state.clone()
    }
}

/// Result of one authoritative poll, tagged with the generation it
/// was issued under.
struct PollOutcome {
    generation: u64,
    history: Result<Vec<HistoryPoint>, ApiError>,
    leaderboard: Result<Vec<LedgerEntry>, ApiError>,
    state: Result<GlobalState, ApiError>,
}

/// One aggregator per tracked metric. The three always share the same
/// granularity and window, and reset together.
struct MetricSet {
    hashes: TimeBucketAggregator,
    super_hashes: TimeBucketAggregator,
    sol_xen: TimeBucketAggregator,
}

impl MetricSet {
    fn new(range: ChartRange) -> Self {
        let unit = range.bucket_unit();
        let window = range.window_secs();
        Self {
            hashes: TimeBucketAggregator::new(unit, window),
            super_hashes: TimeBucketAggregator::new(unit, window),
            sol_xen: TimeBucketAggregator::new(unit, window),
        }
    }

    fn reset(&mut self, range: ChartRange) {
        let unit = range.bucket_unit();
        let window = range.window_secs();
        self.hashes.reset(unit, window);
        self.super_hashes.reset(unit, window);
        self.sol_xen.reset(unit, window);
    }

    /// Apply an authoritative history poll. Each point carries the
    /// per-bucket value for every metric; negative deltas are skipped
    /// as upstream garbage.
    fn reconcile(&mut self, unit: BucketUnit, points: &[HistoryPoint], now: i64) {
        let mut hashes = HashMap::new();
        let mut super_hashes = HashMap::new();
        let mut sol_xen = HashMap::new();

        for point in points {
            let Some(created_at) = point.created_at else {
                continue;
            };
            let key = unit.truncate(created_at.timestamp());

            if point.hashes_delta >= 0 {
                hashes.insert(key, point.hashes_delta as f64);
            }
            if point.super_hashes_delta >= 0 {
                super_hashes.insert(key, point.super_hashes_delta as f64);
            }
            if let Some(delta) = point.sol_xen_delta {
                sol_xen.insert(key, delta as f64 / SOL_XEN_DECIMALS);
            }
        }

        self.hashes.reconcile_at(hashes, now);
        self.super_hashes.reconcile_at(super_hashes, now);
        self.sol_xen.reconcile_at(sol_xen, now);
    }

    fn increment(&mut self, event: &DeltaEvent, now: i64) {
        self.hashes.increment_at(event.hashes as f64, now);
        self.super_hashes.increment_at(event.super_hashes as f64, now);
        self.sol_xen
            .increment_at(event.points as f64 / SOL_XEN_DECIMALS, now);
    }

    fn snapshot(&self, range: ChartRange, now: i64) -> ChartSnapshot {
        ChartSnapshot {
            range,
            hashes: self.hashes.snapshot_at(now),
            super_hashes: self.super_hashes.snapshot_at(now),
            sol_xen: self.sol_xen.snapshot_at(now),
        }
    }
}

/// Reconciles live delta events with periodic authoritative API polls
/// and publishes the merged state.
///
/// The task owns all mutable state; everything else talks to it via
/// commands and watch channels. Poll results carry the generation they
/// were issued under, and a result whose generation no longer matches
/// is discarded, so a range or account switch can never resurrect
/// buckets of the old granularity.
pub struct ReconciliationScheduler<A> {
    api: Arc<A>,
    cfg: SchedulerConfig,
    metrics: Arc<HealthMetrics>,
    command_tx: mpsc::Sender<Command>,
    command_rx: Option<mpsc::Receiver<Command>>,
    chart_tx: watch::Sender<ChartSnapshot>,
    chart_rx: watch::Receiver<ChartSnapshot>,
    ledger_tx: watch::Sender<LedgerView>,
    ledger_rx: watch::Receiver<LedgerView>,
    state_tx: watch::Sender<GlobalState>,
    state_rx: watch::Receiver<GlobalState>,
    cancel: CancellationToken,
}

impl<A: StatsApi + 'static> ReconciliationScheduler<A> {
    pub fn new(api: Arc<A>, cfg: SchedulerConfig, metrics: Arc<HealthMetrics>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (chart_tx, chart_rx) = watch::channel(ChartSnapshot::empty(cfg.default_range));
        let (ledger_tx, ledger_rx) = watch::channel(LedgerView {
            namespace: cfg.namespace,
            entries: Vec::new(),
        });
        let (state_tx, state_rx) = watch::channel(GlobalState::default());

        Self {
            api,
            cfg,
            metrics,
            command_tx,
            command_rx: Some(command_rx),
            chart_tx,
            chart_rx,
            ledger_tx,
            ledger_rx,
            state_tx,
            state_rx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            commands: self.command_tx.clone(),
            chart: self.chart_rx.clone(),
            ledger: self.ledger_rx.clone(),
            state: self.state_rx.clone(),
        }
    }

    /// Spawn the scheduler task. The first poll is issued immediately.
    pub fn start(&mut self, ctx: CancellationToken) {
        let Some(command_rx) = self.command_rx.take() else {
            return;
        };

        let cancel = self.cancel.clone();
        let mut task = SchedulerTask {
            api: self.api.clone(),
            metrics: self.metrics.clone(),
            poll_interval: self.cfg.poll_interval,
            snapshot_interval: self.cfg.snapshot_interval,
            range: self.cfg.default_range,
            account: self.cfg.account.clone(),
            query: LeaderboardQuery {
                namespace: self.cfg.namespace,
                limit: self.cfg.leaderboard.page_size,
                offset: 0,
                sort: self.cfg.leaderboard.sort,
                order: self.cfg.leaderboard.order,
            },
            generation: 0,
            aggregators: MetricSet::new(self.cfg.default_range),
            ledger: LeaderboardLedger::new(self.cfg.namespace),
            chart_tx: self.chart_tx.clone(),
            ledger_tx: self.ledger_tx.clone(),
            state_tx: self.state_tx.clone(),
        };

        tokio::spawn(async move {
            info!(
                range = %task.range,
                namespace = task.query.namespace.as_str(),
                "reconciliation scheduler started",
            );
            task.run(command_rx, ctx, cancel).await;
            info!("reconciliation scheduler stopped");
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

struct SchedulerTask<A> {
    api: Arc<A>,
    metrics: Arc<HealthMetrics>,
    poll_interval: std::time::Duration,
    snapshot_interval: std::time::Duration,
    range: ChartRange,
    account: Option<String>,
    query: LeaderboardQuery,
    generation: u64,
    aggregators: MetricSet,
    ledger: LeaderboardLedger,
    chart_tx: watch::Sender<ChartSnapshot>,
    ledger_tx: watch::Sender<LedgerView>,
    state_tx: watch::Sender<GlobalState>,
}

impl<A: StatsApi + 'static> SchedulerTask<A> {
    async fn run(
        &mut self,
        mut command_rx: mpsc::Receiver<Command>,
        ctx: CancellationToken,
        cancel: CancellationToken,
    ) {
        let (poll_tx, mut poll_rx) = mpsc::channel(POLL_BUFFER);

        let mut poll_ticker = tokio::time::interval(self.poll_interval);
        poll_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut snapshot_ticker = tokio::time::interval(self.snapshot_interval);
        snapshot_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = cancel.cancelled() => break,

                Some(command) = command_rx.recv() => {
                    self.handle_command(command, &poll_tx);
                }

                Some(outcome) = poll_rx.recv() => {
                    self.handle_poll(outcome);
                }

                _ = poll_ticker.tick() => {
                    self.spawn_poll(&poll_tx);
                }

                _ = snapshot_ticker.tick() => {
                    self.publish_chart();
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command, poll_tx: &mpsc::Sender<PollOutcome>) {
        match command {
            Command::SetRange(range) => {
                if range == self.range {
                    return;
                }
                info!(from = %self.range, to = %range, "chart range changed");
                self.range = range;
                self.aggregators.reset(range);
                self.generation += 1;
                self.publish_chart();
                self.spawn_poll(poll_tx);
            }

            Command::SetAccount(account) => {
                if account == self.account {
                    return;
                }
                info!(account = account.as_deref().unwrap_or("<network>"), "tracked account changed");
                self.account = account;
                self.aggregators.reset(self.range);
                self.generation += 1;
                self.publish_chart();
                self.spawn_poll(poll_tx);
            }

            Command::SetNamespace(namespace) => {
                if namespace == self.query.namespace {
                    return;
                }
                info!(namespace = namespace.as_str(), "leaderboard namespace changed");
                self.query.namespace = namespace;
                self.query.offset = 0;
                self.ledger.replace(namespace, Vec::new());
                self.generation += 1;
                self.publish_ledger();
                self.spawn_poll(poll_tx);
            }

            Command::SetPage {
                offset,
                sort,
                order,
            } => {
                if offset == self.query.offset
                    && sort == self.query.sort
                    && order == self.query.order
                {
                    return;
                }
                self.query.offset = offset;
                self.query.sort = sort;
                self.query.order = order;
                self.generation += 1;
                self.spawn_poll(poll_tx);
            }

            Command::Deltas(batch) => {
                self.apply_deltas(batch);
            }
        }
    }

    /// Issue the authoritative fetches for the current query off-task,
    /// tagged with the current generation.
    fn spawn_poll(&self, poll_tx: &mpsc::Sender<PollOutcome>) {
        let api = self.api.clone();
        let generation = self.generation;
        let range = self.range;
        let account = self.account.clone();
        let query = self.query;
        let poll_tx = poll_tx.clone();

        debug!(generation, range = %range, "issuing authoritative poll");

        tokio::spawn(async move {
            let (from, to) = range.fetch_range(unix_now());
            let unit = range.bucket_unit();

            let history = match &account {
                Some(account) => api.fetch_account_history(account, from, to, unit).await,
                None => api.fetch_state_history(from, to, unit).await,
            };
            let leaderboard = api.fetch_leaderboard(&query).await;
            let state = api.fetch_global_state().await;

            let _ = poll_tx
                .send(PollOutcome {
                    generation,
                    history,
                    leaderboard,
                    state,
                })
                .await;
        });
    }

    fn handle_poll(&mut self, outcome: PollOutcome) {
        if outcome.generation != self.generation {
            debug!(
                stale = outcome.generation,
                current = self.generation,
                "discarding superseded poll result",
            );
            self.metrics.stale_polls_discarded.inc();
            return;
        }

        let now = unix_now();

        match outcome.history {
            Ok(points) => {
                self.aggregators
                    .reconcile(self.range.bucket_unit(), &points, now);
                self.publish_chart();
            }
            // Failed polls are retried on the next tick; live state keeps serving.
            Err(e) => warn!(error = %e, "history poll failed"),
        }

        match outcome.leaderboard {
            Ok(entries) => {
                self.ledger.replace(self.query.namespace, entries);
                self.publish_ledger();
            }
            Err(e) => warn!(error = %e, "leaderboard poll failed"),
        }

        match outcome.state {
            Ok(state) => {
                self.state_tx.send_replace(state);
            }
            Err(e) => warn!(error = %e, "global state poll failed"),
        }

        self.metrics.polls_completed.inc();
    }

    fn apply_deltas(&mut self, batch: Vec<DeltaEvent>) {
        let now = unix_now();
        self.metrics.events_received.inc_by(batch.len() as f64);

        for event in &batch {
            if self.charted(event) {
                self.aggregators.increment(event, now);
            }
            self.ledger
                .apply_delta(event.account(self.query.namespace), event.entry_delta());
        }

        self.publish_ledger();
    }

    /// Whether an event's deltas belong on the current chart. The
    /// network view charts every event; with a tracked account only
    /// that account's own activity counts, since the authoritative
    /// history the buckets reconcile against is per-account too.
    fn charted(&self, event: &DeltaEvent) -> bool {
        let Some(tracked) = &self.account else {
            return true;
        };
        let namespace = AccountNamespace::of(tracked);
        namespace.normalize(event.account(namespace)) == namespace.normalize(tracked)
    }

    fn publish_chart(&self) {
        let snapshot = self.aggregators.snapshot(self.range, unix_now());
        for kind in MetricKind::ALL {
            self.metrics
                .buckets_retained
                .with_label_values(&[kind.as_str()])
                .set(snapshot.series(kind).len() as f64);
        }
        self.chart_tx.send_replace(snapshot);
    }

    fn publish_ledger(&self) {
        self.metrics.ledger_entries.set(self.ledger.len() as f64);
        self.ledger_tx.send_replace(LedgerView {
            namespace: self.ledger.namespace(),
            entries: self.ledger.entries().to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;

    use super::*;
    use crate::api::HistoryPoint;

    /// Scripted API: each poll consumes the next canned response pair,
    /// after an optional per-call latency.
    struct ScriptedApi {
        responses: Mutex<Vec<(Duration, Vec<HistoryPoint>)>>,
        history_calls: Mutex<Vec<BucketUnit>>,
    }

    impl ScriptedApi {
        fn new(responses: Vec<(Duration, Vec<HistoryPoint>)>) -> Self {
            Self {
                responses: Mutex::new(responses),
                history_calls: Mutex::new(Vec::new()),
            }
        }

        fn next_response(&self) -> (Duration, Vec<HistoryPoint>) {
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                (Duration::ZERO, Vec::new())
            } else {
                responses.remove(0)
            }
        }
    }

    impl StatsApi for ScriptedApi {
        async fn fetch_leaderboard(
            &self,
            _query: &LeaderboardQuery,
        ) -> Result<Vec<LedgerEntry>, ApiError> {
            Ok(Vec::new())
        }

        async fn fetch_global_state(&self) -> Result<crate::api::GlobalState, ApiError> {
            Ok(crate::api::GlobalState::default())
        }

        async fn fetch_state_history(
            &self,
            _from: chrono::DateTime<Utc>,
            _to: chrono::DateTime<Utc>,
            unit: BucketUnit,
        ) -> Result<Vec<HistoryPoint>, ApiError> {
            self.history_calls.lock().push(unit);
            let (latency, points) = self.next_response();
            tokio::time::sleep(latency).await;
            Ok(points)
        }

        async fn fetch_account_history(
            &self,
            _account: &str,
            from: chrono::DateTime<Utc>,
            to: chrono::DateTime<Utc>,
            unit: BucketUnit,
        ) -> Result<Vec<HistoryPoint>, ApiError> {
            self.fetch_state_history(from, to, unit).await
        }
    }

    fn point(unix_secs: i64, hashes: i64) -> HistoryPoint {
        HistoryPoint {
            created_at: Utc.timestamp_opt(unix_secs, 0).single(),
            hashes_delta: hashes,
            super_hashes_delta: 0,
            sol_xen_delta: None,
        }
    }

    fn scheduler_config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(30),
            snapshot_interval: Duration::from_millis(500),
            default_range: ChartRange::Day,
            ..Default::default()
        }
    }

    fn metrics() -> Arc<HealthMetrics> {
        Arc::new(HealthMetrics::new(":0").expect("metrics build"))
    }

    /// Yield until the api has issued at least `count` history polls.
    /// Yielding never advances paused time, so in-flight latencies
    /// stay in flight.
    async fn polls_issued(api: &ScriptedApi, count: usize) {
        while api.history_calls.lock().len() < count {
            tokio::task::yield_now().await;
        }
    }

    /// Follow the chart watch until a snapshot satisfies `predicate`.
    /// Waiting on the watch lets paused time auto-advance through the
    /// poll and snapshot timers.
    async fn chart_when(
        handle: &SchedulerHandle,
        predicate: impl Fn(&ChartSnapshot) -> bool,
    ) -> ChartSnapshot {
        let mut chart = handle.chart();
        loop {
            {
                let snapshot = chart.borrow();
                if predicate(&snapshot) {
                    return snapshot.clone();
                }
            }
            chart.changed().await.expect("scheduler running");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_poll_populates_chart() {
        let now = unix_now();
        let bucket = BucketUnit::Hour.truncate(now - 3_600);
        let api = Arc::new(ScriptedApi::new(vec![(
            Duration::ZERO,
            vec![point(bucket, 41)],
        )]));

        let mut scheduler = ReconciliationScheduler::new(api, scheduler_config(), metrics());
        let handle = scheduler.handle();
        scheduler.start(CancellationToken::new());

        let chart = chart_when(&handle, |c| !c.hashes.is_empty()).await;
        assert_eq!(chart.hashes.len(), 1);
        assert_eq!(chart.hashes[0].time.timestamp(), bucket);
        assert_eq!(chart.hashes[0].value, 41.0);

        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_range_change_supersedes_inflight_poll() {
        let now = unix_now();
        let stale_bucket = BucketUnit::Hour.truncate(now - 7_200);
        let fresh_bucket = BucketUnit::Day.truncate(now - 86_400);

        // The first poll is slow and still in flight when the range
        // changes; the second returns quickly for the new range.
        let api = Arc::new(ScriptedApi::new(vec![
            (Duration::from_secs(10), vec![point(stale_bucket, 111)]),
            (Duration::from_secs(1), vec![point(fresh_bucket, 222)]),
        ]));

        let metrics = metrics();
        let mut scheduler =
            ReconciliationScheduler::new(api.clone(), scheduler_config(), metrics.clone());
        let handle = scheduler.handle();
        scheduler.start(CancellationToken::new());

        // Let the first poll launch, then switch ranges mid-flight.
        polls_issued(&api, 1).await;
        handle.set_range(ChartRange::Week).await;
        polls_issued(&api, 2).await;

        // Push past both latencies, then let the outcomes drain.
        tokio::time::advance(Duration::from_secs(15)).await;
        while metrics.stale_polls_discarded.get() < 1.0 {
            tokio::task::yield_now().await;
        }

        // Only the new-generation result is visible; the slow result
        // was discarded on arrival.
        let chart = chart_when(&handle, |c| !c.hashes.is_empty()).await;
        assert_eq!(chart.range, ChartRange::Week);
        assert_eq!(chart.hashes.len(), 1);
        assert_eq!(chart.hashes[0].value, 222.0);
        assert_eq!(metrics.stale_polls_discarded.get(), 1.0);

        // Second fetch went out with the new granularity.
        let calls = api.history_calls.lock().clone();
        assert_eq!(calls, vec![BucketUnit::Hour, BucketUnit::Day]);

        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deltas_dropped_until_first_poll_lands() {
        let now = unix_now();
        let bucket = BucketUnit::Hour.truncate(now - 3_600);
        let api = Arc::new(ScriptedApi::new(vec![(
            Duration::from_secs(5),
            vec![point(bucket, 7)],
        )]));

        let mut scheduler = ReconciliationScheduler::new(api.clone(), scheduler_config(), metrics());
        let handle = scheduler.handle();
        scheduler.start(CancellationToken::new());

        // Poll still in flight: the increment has no snapshot to land on.
        polls_issued(&api, 1).await;
        let event = DeltaEvent {
            slot: 1,
            sol_account: "Miner".to_string(),
            eth_account: String::new(),
            hashes: 50,
            super_hashes: 0,
            points: 0,
        };
        handle
            .commands()
            .send(Command::Deltas(vec![event.clone()]))
            .await
            .expect("send");
        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert!(handle.chart().borrow().hashes.is_empty());

        // After the poll lands, increments take effect. Were the first
        // send not dropped, the live bucket would read 100 here.
        tokio::time::advance(Duration::from_secs(6)).await;
        chart_when(&handle, |c| !c.hashes.is_empty()).await;
        handle
            .commands()
            .send(Command::Deltas(vec![event]))
            .await
            .expect("send");

        let current = BucketUnit::Hour.truncate(unix_now());
        let chart =
            chart_when(&handle, |c| c.hashes.iter().any(|p| p.time.timestamp() == current)).await;
        let live = chart
            .hashes
            .iter()
            .find(|p| p.time.timestamp() == current)
            .expect("live bucket");
        assert_eq!(live.value, 50.0);

        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracked_account_chart_ignores_foreign_deltas() {
        let now = unix_now();
        let bucket = BucketUnit::Hour.truncate(now - 3_600);
        let api = Arc::new(ScriptedApi::new(vec![(
            Duration::ZERO,
            vec![point(bucket, 3)],
        )]));

        let cfg = SchedulerConfig {
            account: Some("TrackedMiner1111111111111111111111111111111".to_string()),
            ..scheduler_config()
        };
        let mut scheduler = ReconciliationScheduler::new(api.clone(), cfg, metrics());
        let handle = scheduler.handle();
        scheduler.start(CancellationToken::new());

        let chart = chart_when(&handle, |c| !c.hashes.is_empty()).await;
        assert_eq!(chart.hashes[0].value, 3.0);

        // One foreign event, one from the tracked account. Only the
        // tracked account's hashes may reach the per-account chart;
        // the ledger still takes both.
        let foreign = DeltaEvent {
            slot: 2,
            sol_account: "SomeOtherMiner1111111111111111111111111111".to_string(),
            eth_account: String::new(),
            hashes: 50,
            super_hashes: 0,
            points: 0,
        };
        let own = DeltaEvent {
            slot: 2,
            sol_account: "TrackedMiner1111111111111111111111111111111".to_string(),
            eth_account: String::new(),
            hashes: 8,
            super_hashes: 0,
            points: 0,
        };
        handle
            .commands()
            .send(Command::Deltas(vec![foreign, own]))
            .await
            .expect("send");

        let current = BucketUnit::Hour.truncate(unix_now());
        let chart =
            chart_when(&handle, |c| c.hashes.iter().any(|p| p.time.timestamp() == current)).await;
        let live = chart
            .hashes
            .iter()
            .find(|p| p.time.timestamp() == current)
            .expect("live bucket");
        assert_eq!(live.value, 8.0);

        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_namespace_change_clears_ledger() {
        let api = Arc::new(ScriptedApi::new(Vec::new()));
        let mut scheduler = ReconciliationScheduler::new(api, scheduler_config(), metrics());
        let handle = scheduler.handle();
        scheduler.start(CancellationToken::new());
        tokio::time::advance(Duration::from_millis(100)).await;

        handle.set_namespace(AccountNamespace::Ethereum).await;
        tokio::time::advance(Duration::from_millis(100)).await;

        let view = handle.ledger().borrow().clone();
        assert_eq!(view.namespace, AccountNamespace::Ethereum);
        assert!(view.entries.is_empty());

        scheduler.stop();
    }

    #[test]
    fn test_reconcile_skips_negative_and_untimed_points() {
        let mut set = MetricSet::new(ChartRange::Day);
        let now = 200_000;

        let points = vec![
            point(BucketUnit::Hour.truncate(now - 7_200), -5),
            HistoryPoint {
                created_at: None,
                hashes_delta: 9,
                super_hashes_delta: 0,
                sol_xen_delta: None,
            },
            point(BucketUnit::Hour.truncate(now - 3_600), 4),
        ];
        set.reconcile(BucketUnit::Hour, &points, now);

        let snapshot = set.snapshot(ChartRange::Day, now);
        assert_eq!(snapshot.hashes.len(), 1);
        assert_eq!(snapshot.hashes[0].value, 4.0);
    }

    #[test]
    fn test_sol_xen_scaled_from_raw_units() {
        let mut set = MetricSet::new(ChartRange::Day);
        let now = 200_000;

        let points = vec![HistoryPoint {
            created_at: Utc.timestamp_opt(BucketUnit::Hour.truncate(now - 3_600), 0).single(),
            hashes_delta: 0,
            super_hashes_delta: 0,
            sol_xen_delta: Some(2_500_000_000),
        }];
        set.reconcile(BucketUnit::Hour, &points, now);

        let snapshot = set.snapshot(ChartRange::Day, now);
        assert_eq!(snapshot.sol_xen.len(), 1);
        assert_eq!(snapshot.sol_xen[0].value, 2.5);
    }
}
