use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api;
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::scheduler::{Command, ReconciliationScheduler, SchedulerHandle};
use crate::stream::batcher::EventStreamBatcher;
use crate::stream::ChannelSource;

/// Agent orchestrates all components: event source, batcher,
/// scheduler, and the health server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    source: Arc<ChannelSource>,
    batcher: Option<EventStreamBatcher<ChannelSource>>,
    scheduler: Option<ReconciliationScheduler<api::Client>>,
    handle: Option<SchedulerHandle>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            source: Arc::new(ChannelSource::new()),
            batcher: None,
            scheduler: None,
            handle: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin aggregating.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Start health metrics server first so probes respond during
        //    the initial poll.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;
        info!("health metrics server started");

        // 2. Scheduler over the aggregation API. Its first poll goes
        //    out immediately.
        let client = self.create_api_client()?;
        let mut scheduler = ReconciliationScheduler::new(
            Arc::new(client),
            self.cfg.scheduler.clone(),
            Arc::clone(&self.health),
        );
        let handle = scheduler.handle();
        scheduler.start(self.cancel.child_token());

        // 3. Batcher funnels live events into the scheduler. A full
        //    command channel means the scheduler has stalled; dropping
        //    the batch is recovered by the next authoritative poll.
        let mut batcher =
            EventStreamBatcher::new(Arc::clone(&self.source), self.cfg.stream.refresh_rate);

        let commands = handle.commands();
        let health_flush = Arc::clone(&self.health);
        batcher.start(
            Box::new(move |batch| {
                health_flush.batches_flushed.inc();
                if commands.try_send(Command::Deltas(batch)).is_err() {
                    warn!("scheduler command channel full, dropping batch");
                }
            }),
            self.cancel.child_token(),
        );

        batcher.set_sources(&self.cfg.stream.sources).await;
        self.health
            .sources_active
            .set(batcher.active_sources() as f64);
        info!(
            sources = batcher.active_sources(),
            "event stream subscriptions open",
        );

        self.batcher = Some(batcher);
        self.scheduler = Some(scheduler);
        self.handle = Some(handle);

        info!(
            client = %self.cfg.meta_client_name,
            network = %self.cfg.meta_network_name,
            "agent fully started",
        );

        Ok(())
    }

    /// Handle for issuing commands and reading published state.
    pub fn handle(&self) -> Option<SchedulerHandle> {
        self.handle.clone()
    }

    /// The in-process event source. Transports push decoded delta
    /// events through this.
    pub fn source(&self) -> Arc<ChannelSource> {
        Arc::clone(&self.source)
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop the batcher first so no flush races the scheduler teardown.
        if let Some(batcher) = &self.batcher {
            batcher.stop();
        }

        if let Some(scheduler) = &self.scheduler {
            scheduler.stop();
        }

        self.cancel.cancel();

        self.health.stop().await?;

        Ok(())
    }

    /// Create an API client with metrics callback.
    fn create_api_client(&self) -> Result<api::Client> {
        let client = api::Client::new(&self.cfg.api).context("creating API client")?;

        let health = Arc::clone(&self.health);
        let client = client.with_metrics(Box::new(move |endpoint, status, duration| {
            health
                .api_requests_total
                .with_label_values(&[endpoint, status])
                .inc();
            health
                .api_request_duration
                .with_label_values(&[endpoint])
                .observe(duration.as_secs_f64());
        }));

        Ok(client)
    }
}
