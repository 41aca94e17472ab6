use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{DeltaEvent, EventSource};

/// Capacity of the funnel channel all subscriptions feed into.
const FUNNEL_BUFFER: usize = 16_384;

/// Callback receiving one flushed batch in arrival order.
pub type BatchHandler = Box<dyn FnMut(Vec<DeltaEvent>) + Send>;

/// Buffers push-delivered delta events from any number of sources and
/// flushes the accumulated batch to a handler on a fixed cadence.
///
/// The source id set may change at runtime; `set_sources` cancels
/// removed subscriptions and opens added ones without disturbing
/// sources present in both sets. One source's subscribe failure never
/// affects the others or the flush timer. After `stop` (or parent
/// cancellation) the handler is never invoked again, even for events
/// already buffered.
pub struct EventStreamBatcher<S> {
    source: Arc<S>,
    refresh_rate: Duration,
    funnel_tx: mpsc::Sender<DeltaEvent>,
    /// Funnel receiver, taken by `start`.
    funnel_rx: Option<mpsc::Receiver<DeltaEvent>>,
    /// Per-source cancellation tokens for open subscriptions.
    subscriptions: parking_lot::Mutex<HashMap<String, CancellationToken>>,
    cancel: CancellationToken,
}

impl<S: EventSource + 'static> EventStreamBatcher<S> {
    pub fn new(source: Arc<S>, refresh_rate: Duration) -> Self {
        let (funnel_tx, funnel_rx) = mpsc::channel(FUNNEL_BUFFER);

        Self {
            source,
            refresh_rate,
            funnel_tx,
            funnel_rx: Some(funnel_rx),
            subscriptions: parking_lot::Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the flush loop. Events already buffered when `ctx` is
    /// cancelled are discarded, never delivered late.
    pub fn start(&mut self, mut handler: BatchHandler, ctx: CancellationToken) {
        self.cancel = ctx;
        let cancel = self.cancel.clone();
        let refresh_rate = self.refresh_rate;
        let mut funnel_rx = self.funnel_rx.take().expect("start called more than once");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh_rate);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut buffer: Vec<DeltaEvent> = Vec::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(buffered = buffer.len(), "batcher stopped");
                        return;
                    }
                    event = funnel_rx.recv() => {
                        match event {
                            Some(event) => buffer.push(event),
                            // All senders gone; keep ticking so any
                            // still-buffered events flush.
                            None => {
                                cancel.cancelled().await;
                                return;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if buffer.is_empty() || cancel.is_cancelled() {
                            continue;
                        }
                        handler(std::mem::take(&mut buffer));
                    }
                }
            }
        });
    }

    /// Reconcile the active subscription set with `source_ids`:
    /// cancels subscriptions for removed ids, opens subscriptions for
    /// added ids, leaves the rest untouched.
    pub async fn set_sources(&self, source_ids: &[String]) {
        let (added, removed) = {
            let subscriptions = self.subscriptions.lock();
            let added: Vec<String> = source_ids
                .iter()
                .filter(|id| !subscriptions.contains_key(*id))
                .cloned()
                .collect();
            let removed: Vec<String> = subscriptions
                .keys()
                .filter(|id| !source_ids.contains(id))
                .cloned()
                .collect();
            (added, removed)
        };

        for id in removed {
            if let Some(token) = self.subscriptions.lock().remove(&id) {
                token.cancel();
                debug!(source_id = %id, "subscription cancelled");
            }
        }

        for id in added {
            self.open_subscription(id).await;
        }
    }

    /// Cancel the flush timer and all subscriptions. No handler
    /// invocation happens after this returns.
    pub fn stop(&self) {
        self.cancel.cancel();
        for (_, token) in self.subscriptions.lock().drain() {
            token.cancel();
        }
    }

    /// Number of currently open subscriptions.
    pub fn active_sources(&self) -> usize {
        self.subscriptions.lock().len()
    }

    async fn open_subscription(&self, source_id: String) {
        // A failed subscribe is isolated: other sources and the flush
        // timer keep running, and the id stays out of the active set
        // so a later set_sources can retry it.
        let mut rx = match self.source.subscribe(&source_id).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(source_id = %source_id, error = %e, "subscription failed");
                return;
            }
        };

        let token = self.cancel.child_token();
        self.subscriptions
            .lock()
            .insert(source_id.clone(), token.clone());

        let funnel = self.funnel_tx.clone();
        debug!(source_id = %source_id, "subscription opened");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    event = rx.recv() => {
                        let Some(event) = event else {
                            debug!(source_id = %source_id, "source closed the stream");
                            return;
                        };
                        if funnel.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::stream::ChannelSource;

    fn event(sol: &str, hashes: u64) -> DeltaEvent {
        DeltaEvent {
            slot: 1,
            sol_account: sol.to_string(),
            eth_account: "0xabcd000000000000000000000000000000000001".to_string(),
            hashes,
            super_hashes: 0,
            points: 0,
        }
    }

    /// Handler that records each flushed batch.
    fn recording_handler(batches: Arc<Mutex<Vec<Vec<DeltaEvent>>>>) -> BatchHandler {
        Box::new(move |batch| {
            batches.lock().expect("not poisoned").push(batch);
        })
    }

    async fn started_batcher(
        source: Arc<ChannelSource>,
        ids: &[&str],
    ) -> (EventStreamBatcher<ChannelSource>, Arc<Mutex<Vec<Vec<DeltaEvent>>>>) {
        let mut batcher = EventStreamBatcher::new(source, Duration::from_millis(500));
        let batches = Arc::new(Mutex::new(Vec::new()));
        batcher.start(recording_handler(Arc::clone(&batches)), CancellationToken::new());

        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        batcher.set_sources(&ids).await;

        (batcher, batches)
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_buffer_skips_handler() {
        let source = Arc::new(ChannelSource::new());
        let (_batcher, batches) = started_batcher(Arc::clone(&source), &["prog"]).await;

        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;

        assert!(batches.lock().expect("not poisoned").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_delivers_whole_buffer_once_in_order() {
        let source = Arc::new(ChannelSource::new());
        let (_batcher, batches) = started_batcher(Arc::clone(&source), &["prog"]).await;

        source.emit("prog", event("A", 1));
        source.emit("prog", event("A", 2));
        source.emit("prog", event("B", 3));

        // Let forwarders move events into the buffer, then tick once.
        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;

        {
            let seen = batches.lock().expect("not poisoned");
            assert_eq!(seen.len(), 1);
            let hashes: Vec<u64> = seen[0].iter().map(|e| e.hashes).collect();
            assert_eq!(hashes, vec![1, 2, 3]);
        }

        // Buffer was cleared: the next tick has nothing to flush.
        tokio::time::advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        assert_eq!(batches.lock().expect("not poisoned").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_handler_invocation_after_stop() {
        let source = Arc::new(ChannelSource::new());
        let (batcher, batches) = started_batcher(Arc::clone(&source), &["prog"]).await;

        source.emit("prog", event("A", 1));
        tokio::task::yield_now().await;

        batcher.stop();
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;

        assert!(batches.lock().expect("not poisoned").is_empty());
        assert_eq!(batcher.active_sources(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_set_change_keeps_unaffected_sources() {
        let source = Arc::new(ChannelSource::new());
        let (batcher, batches) = started_batcher(Arc::clone(&source), &["keep", "drop"]).await;
        assert_eq!(batcher.active_sources(), 2);

        batcher
            .set_sources(&["keep".to_string(), "add".to_string()])
            .await;
        tokio::task::yield_now().await;
        assert_eq!(batcher.active_sources(), 2);

        // The kept source still has exactly one live subscription (no
        // resubscribe churn), the removed one none, the added one is live.
        assert_eq!(source.subscriber_count("keep"), 1);
        assert_eq!(source.subscriber_count("drop"), 0);
        assert_eq!(source.subscriber_count("add"), 1);

        source.emit("keep", event("A", 1));
        source.emit("drop", event("A", 2));
        source.emit("add", event("A", 3));

        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;

        let seen = batches.lock().expect("not poisoned");
        assert_eq!(seen.len(), 1);
        let hashes: Vec<u64> = seen[0].iter().map(|e| e.hashes).collect();
        assert_eq!(hashes, vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_is_isolated() {
        let source = Arc::new(ChannelSource::new());
        // "" is rejected by ChannelSource::subscribe.
        let (batcher, batches) =
            started_batcher(Arc::clone(&source), &["good", ""]).await;
        assert_eq!(batcher.active_sources(), 1);

        source.emit("good", event("A", 7));
        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;

        let seen = batches.lock().expect("not poisoned");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][0].hashes, 7);
    }
}
