//! Per-conversation debounce with a busy lock.
//!
//! Every inbound message is appended to its conversation's buffer. The
//! arrival then waits out the stability window and tries an atomic drain:
//! the drain only happens if the buffer did not grow in the meantime and no
//! other run holds the conversation's busy flag. A burst of messages
//! therefore produces one downstream call, triggered by the last of them.
//!
//! Each run owns its busy flag through a random token and keeps extending
//! the flag while the downstream call is running, so a slow call never lets
//! a second run start for the same conversation. After the call returns (or
//! fails, or panics) the run releases its own flag and the buffer is checked
//! again, so messages that arrived meanwhile are picked up after a short
//! settle delay.

use crate::config::BatcherSettings;
use crate::error::{QueueError, QueueResult, UpstreamError};
use crate::executor::SharedExecutor;
use crate::jobs::{CancellationToken, Ticker};
use crate::store::{DrainOutcome, SharedStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// One inbound message waiting in a conversation buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedMessage {
    /// Caller-assigned message id.
    pub id: String,
    /// Message body.
    pub text: String,
    /// Arrival time; batches are ordered by it.
    pub received_at: DateTime<Utc>,
    /// Opaque caller data carried into the batch.
    #[serde(default)]
    pub metadata: Value,
}

impl BufferedMessage {
    /// Message received now, without metadata.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            received_at: Utc::now(),
            metadata: Value::Null,
        }
    }

    /// Override the arrival time.
    #[must_use]
    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    /// Attach caller data.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Messages drained from one conversation, handed downstream as one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    /// Conversation key.
    pub conversation: String,
    /// Drained messages in arrival order.
    pub items: Vec<BufferedMessage>,
    /// Message texts joined with the configured separator.
    pub text: String,
}

impl Batch {
    /// Sort `items` by arrival and join their texts.
    #[must_use]
    pub fn new(conversation: impl Into<String>, mut items: Vec<BufferedMessage>, separator: &str) -> Self {
        items.sort_by_key(|item| item.received_at);
        let text = items
            .iter()
            .map(|item| item.text.as_str())
            .collect::<Vec<_>>()
            .join(separator);
        Self {
            conversation: conversation.into(),
            items,
            text,
        }
    }
}

/// What one drain attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainDecision {
    /// The buffer was already empty.
    Empty,
    /// More messages arrived during the window; a later arrival takes over.
    StillGrowing,
    /// Another run is processing the conversation; it rechecks when done.
    Busy,
    /// This many messages went downstream as one batch.
    Processed(usize),
}

/// Downstream consumer of batches.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Handle one batch. Errors are logged and count as completion.
    async fn handle_batch(&self, batch: &Batch) -> Result<(), UpstreamError>;
}

/// Shared batch handler.
pub type SharedBatchHandler = Arc<dyn BatchHandler>;

/// Runs each batch through an [`Executor`](crate::executor::Executor), with
/// the conversation key as subject.
pub struct ExecutorBatchHandler {
    executor: SharedExecutor,
}

impl ExecutorBatchHandler {
    /// Wrap `executor`.
    #[must_use]
    pub fn new(executor: SharedExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl BatchHandler for ExecutorBatchHandler {
    async fn handle_batch(&self, batch: &Batch) -> Result<(), UpstreamError> {
        let payload = json!({
            "text": batch.text,
            "messages": batch.items,
        });
        self.executor.execute(&batch.conversation, &payload).await.map(|_| ())
    }
}

/// Debounces per-conversation messages into single downstream calls.
#[derive(Clone)]
pub struct ConversationBatcher {
    inner: Arc<BatcherInner>,
}

struct BatcherInner {
    store: SharedStore,
    handler: SharedBatchHandler,
    settings: BatcherSettings,
    shutdown: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    watchdog: Mutex<Option<Ticker>>,
}

impl std::fmt::Debug for ConversationBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationBatcher")
            .field("store", &self.inner.store)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl ConversationBatcher {
    /// Batcher on `store` delivering to `handler`.
    #[must_use]
    pub fn new(store: SharedStore, handler: SharedBatchHandler, settings: BatcherSettings) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                store,
                handler,
                settings,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(JoinSet::new()),
                watchdog: Mutex::new(None),
            }),
        }
    }

    /// Batcher delivering through an executor.
    #[must_use]
    pub fn with_executor(store: SharedStore, executor: SharedExecutor, settings: BatcherSettings) -> Self {
        Self::new(store, Arc::new(ExecutorBatchHandler::new(executor)), settings)
    }

    /// Settings in use.
    #[must_use]
    pub fn settings(&self) -> &BatcherSettings {
        &self.inner.settings
    }

    /// Buffer `message`, wait out the stability window and drain the
    /// conversation if it is quiet and idle.
    ///
    /// Resolves after the downstream call when this arrival triggered one.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShuttingDown`] if shutdown interrupts the
    /// window, or a store error.
    pub async fn handle_message(&self, conversation: &str, message: BufferedMessage) -> QueueResult<DrainDecision> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }

        let len = inner
            .store
            .buffer_push(conversation, &message, inner.settings.buffer_ttl())
            .await?;
        debug!(conversation, message_id = %message.id, buffered = len, "Message buffered");

        if !inner.shutdown.sleep(inner.settings.stability_window()).await {
            return Err(QueueError::ShuttingDown);
        }
        self.drain_cycle(conversation, len).await
    }

    /// Run [`handle_message`](Self::handle_message) in the background.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ShuttingDown`] after shutdown.
    pub fn push(&self, conversation: impl Into<String>, message: BufferedMessage) -> QueueResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }

        let conversation = conversation.into();
        let batcher = self.clone();
        self.spawn(async move {
            match batcher.handle_message(&conversation, message).await {
                Ok(_) | Err(QueueError::ShuttingDown) => {}
                Err(e) => error!(conversation = %conversation, error = %e, "Message handling failed"),
            }
        });
        Ok(())
    }

    /// Start the watchdog that drains buffers no arrival is going to recheck.
    /// Calling it again replaces the running watchdog.
    pub fn start_watchdog(&self) {
        let batcher = self.clone();
        let ticker = Ticker::spawn(
            "batcher-watchdog",
            self.inner.settings.watchdog_interval(),
            &self.inner.shutdown,
            move || {
                let batcher = batcher.clone();
                async move { batcher.sweep().await }
            },
        );
        *self.inner.watchdog.lock() = Some(ticker);
    }

    /// Stop the watchdog, cut short pending stability windows and wait for
    /// running downstream calls.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let watchdog = self.inner.watchdog.lock().take();
        if let Some(watchdog) = watchdog {
            watchdog.stop().await;
        }

        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        while tasks.join_next().await.is_some() {}
        info!("Conversation batcher shut down");
    }

    /// Check every buffered conversation and schedule a drain for the idle
    /// ones.
    async fn sweep(&self) {
        let conversations = match self.inner.store.buffered_conversations().await {
            Ok(conversations) => conversations,
            Err(e) => {
                error!(error = %e, "Listing conversation buffers failed");
                return;
            }
        };

        for conversation in conversations {
            match self.inner.store.is_busy(&conversation).await {
                Ok(false) => {}
                Ok(true) => continue,
                Err(e) => {
                    warn!(conversation = %conversation, error = %e, "Busy check failed");
                    continue;
                }
            }
            debug!(conversation = %conversation, "Watchdog found idle buffer");
            let batcher = self.clone();
            self.spawn(async move { batcher.stable_recheck(&conversation).await });
        }
    }

    /// Sample the buffer, wait the stability window and drain if unchanged.
    async fn stable_recheck(&self, conversation: &str) {
        let inner = &self.inner;
        let len = match inner.store.buffer_len(conversation).await {
            Ok(0) => return,
            Ok(len) => len,
            Err(e) => {
                warn!(conversation, error = %e, "Buffer check failed");
                return;
            }
        };
        if !inner.shutdown.sleep(inner.settings.stability_window()).await {
            return;
        }
        if let Err(e) = self.drain_cycle(conversation, len).await {
            error!(conversation, error = %e, "Drain failed");
        }
    }

    async fn drain_cycle(&self, conversation: &str, expected: usize) -> QueueResult<DrainDecision> {
        let token = uuid::Uuid::new_v4().to_string();
        let outcome = self
            .inner
            .store
            .begin_drain(conversation, expected, &token, self.inner.settings.busy_ttl())
            .await?;

        match outcome {
            DrainOutcome::Empty => Ok(DrainDecision::Empty),
            DrainOutcome::StillGrowing { expected, actual } => {
                debug!(conversation, expected, actual, "Buffer still growing");
                Ok(DrainDecision::StillGrowing)
            }
            DrainOutcome::Busy => {
                debug!(conversation, "Conversation busy, in-flight run will recheck");
                Ok(DrainDecision::Busy)
            }
            DrainOutcome::Drained(items) => {
                let count = items.len();
                self.process(conversation, &token, items).await;
                Ok(DrainDecision::Processed(count))
            }
        }
    }

    /// Deliver a drained batch, then always release the busy flag and
    /// schedule a settle recheck.
    async fn process(&self, conversation: &str, token: &str, items: Vec<BufferedMessage>) {
        let batch = Batch::new(conversation, items, &self.inner.settings.separator);
        let count = batch.items.len();
        info!(conversation, messages = count, "Processing batch");

        // The set aborts the heartbeat on drop
        let mut heartbeat = JoinSet::new();
        heartbeat.spawn(self.heartbeat(conversation, token));
        let handler = Arc::clone(&self.inner.handler);
        let delivery = tokio::spawn(async move { handler.handle_batch(&batch).await });
        let delivered = delivery.await;
        heartbeat.abort_all();

        match delivered {
            Ok(Ok(())) => debug!(conversation, messages = count, "Batch handled"),
            Ok(Err(e)) => warn!(conversation, error = %e, "Batch handler failed"),
            Err(e) if e.is_panic() => error!(conversation, "Batch handler panicked"),
            Err(e) => error!(conversation, error = %e, "Batch handler was cancelled"),
        }

        match self.inner.store.release(conversation, token).await {
            Ok(true) => {}
            Ok(false) => warn!(conversation, "Busy flag was no longer held by this run"),
            Err(e) => error!(conversation, error = %e, "Releasing busy flag failed; it expires with its TTL"),
        }
        self.schedule_settle_recheck(conversation.to_string());
    }

    /// Keep extending this run's busy flag until aborted.
    fn heartbeat(&self, conversation: &str, token: &str) -> impl std::future::Future<Output = ()> + Send + 'static {
        let store = Arc::clone(&self.inner.store);
        let busy_ttl = self.inner.settings.busy_ttl();
        let period = self.inner.settings.busy_heartbeat();
        let conversation = conversation.to_string();
        let token = token.to_string();
        async move {
            loop {
                tokio::time::sleep(period).await;
                match store.extend_busy(&conversation, &token, busy_ttl).await {
                    Ok(true) => debug!(conversation = %conversation, "Busy flag extended"),
                    Ok(false) => {
                        error!(conversation = %conversation, "Busy flag lost while the batch is still running");
                        return;
                    }
                    Err(e) => warn!(conversation = %conversation, error = %e, "Extending busy flag failed"),
                }
            }
        }
    }

    fn schedule_settle_recheck(&self, conversation: String) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let batcher = self.clone();
        self.spawn(async move {
            let inner = &batcher.inner;
            if !inner.shutdown.sleep(inner.settings.settle_delay()).await {
                return;
            }
            let len = match inner.store.buffer_len(&conversation).await {
                Ok(0) => return,
                Ok(len) => len,
                Err(e) => {
                    warn!(conversation = %conversation, error = %e, "Settle recheck failed");
                    return;
                }
            };
            debug!(conversation = %conversation, buffered = len, "Messages arrived during processing");
            if let Err(e) = batcher.drain_cycle(&conversation, len).await {
                error!(conversation = %conversation, error = %e, "Drain failed");
            }
        });
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.inner.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JobStore, MemoryStore};
    use chrono::TimeDelta;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<(Batch, Instant)>>,
        delay: Duration,
    }

    #[async_trait]
    impl BatchHandler for Recorder {
        async fn handle_batch(&self, batch: &Batch) -> Result<(), UpstreamError> {
            self.batches.lock().push((batch.clone(), Instant::now()));
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn batcher_with(handler: SharedBatchHandler) -> (ConversationBatcher, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let batcher = ConversationBatcher::new(store.clone(), handler, BatcherSettings::default());
        (batcher, store)
    }

    #[test]
    fn test_batch_orders_by_arrival() {
        let t0 = Utc::now();
        let items = vec![
            BufferedMessage::new("2", "you").received_at(t0 + TimeDelta::seconds(2)),
            BufferedMessage::new("0", "hi").received_at(t0),
            BufferedMessage::new("1", "how are").received_at(t0 + TimeDelta::seconds(1)),
        ];
        let batch = Batch::new("conv", items, "\n");
        assert_eq!(batch.text, "hi\nhow are\nyou");
        assert_eq!(batch.items[0].id, "0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_becomes_one_batch() {
        let recorder = Arc::new(Recorder::default());
        let (batcher, store) = batcher_with(recorder.clone());
        let start = Instant::now();

        batcher.push("conv-1", BufferedMessage::new("m1", "hi")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        batcher.push("conv-1", BufferedMessage::new("m2", "how")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        batcher.push("conv-1", BufferedMessage::new("m3", "are you")).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let batches = recorder.batches.lock();
        assert_eq!(batches.len(), 1);
        let (batch, at) = &batches[0];
        assert_eq!(batch.text, "hi\nhow\nare you");
        assert_eq!(batch.conversation, "conv-1");
        assert!(*at - start >= Duration::from_secs(5));
        assert!(*at - start < Duration::from_secs(6));
        drop(batches);

        assert!(!store.is_busy("conv-1").await.unwrap());
        assert_eq!(store.buffer_len("conv-1").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_during_processing_is_not_lost() {
        let recorder = Arc::new(Recorder {
            delay: Duration::from_secs(5),
            ..Recorder::default()
        });
        let (batcher, store) = batcher_with(recorder.clone());

        batcher.push("c", BufferedMessage::new("a", "first")).unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(store.is_busy("c").await.unwrap());

        let second = batcher.clone();
        let late = tokio::spawn(async move { second.handle_message("c", BufferedMessage::new("b", "second")).await });
        assert_eq!(late.await.unwrap().unwrap(), DrainDecision::Busy);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let texts: Vec<String> = recorder.batches.lock().iter().map(|(b, _)| b.text.clone()).collect();
        assert_eq!(texts, vec!["first".to_string(), "second".to_string()]);
        assert_eq!(store.buffer_len("c").await.unwrap(), 0);
        assert!(!store.is_busy("c").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_releases_busy_flag() {
        let mut handler = MockBatchHandler::new();
        handler
            .expect_handle_batch()
            .withf(|batch| batch.text == "boom")
            .times(1)
            .returning(|_| panic!("downstream exploded"));
        handler
            .expect_handle_batch()
            .withf(|batch| batch.text == "fine")
            .times(1)
            .returning(|_| Ok(()));
        let (batcher, store) = batcher_with(Arc::new(handler));

        let first = batcher.handle_message("c", BufferedMessage::new("1", "boom")).await.unwrap();
        assert_eq!(first, DrainDecision::Processed(1));
        assert!(!store.is_busy("c").await.unwrap());

        let second = batcher.handle_message("c", BufferedMessage::new("2", "fine")).await.unwrap();
        assert_eq!(second, DrainDecision::Processed(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_error_counts_as_completion() {
        let mut handler = MockBatchHandler::new();
        handler
            .expect_handle_batch()
            .times(1)
            .returning(|_| Err(UpstreamError::Rejected("no".into())));
        let (batcher, store) = batcher_with(Arc::new(handler));

        let decision = batcher.handle_message("c", BufferedMessage::new("1", "x")).await.unwrap();
        assert_eq!(decision, DrainDecision::Processed(1));
        assert!(!store.is_busy("c").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_drains_stranded_buffer() {
        let recorder = Arc::new(Recorder::default());
        let (batcher, store) = batcher_with(recorder.clone());
        let ttl = batcher.settings().buffer_ttl();
        store.buffer_push("orphan", &BufferedMessage::new("1", "left behind"), ttl).await.unwrap();

        batcher.start_watchdog();
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(recorder.batches.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let batches = recorder.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0.text, "left behind");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_stability_window() {
        let recorder = Arc::new(Recorder::default());
        let (batcher, _store) = batcher_with(recorder.clone());

        let waiting = batcher.clone();
        let pending = tokio::spawn(async move { waiting.handle_message("c", BufferedMessage::new("1", "hi")).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        batcher.shutdown().await;

        assert!(matches!(pending.await.unwrap(), Err(QueueError::ShuttingDown)));
        assert!(recorder.batches.lock().is_empty());
        assert!(matches!(
            batcher.push("c", BufferedMessage::new("2", "late")),
            Err(QueueError::ShuttingDown)
        ));
    }

    #[derive(Default)]
    struct Overlap {
        running: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
        texts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BatchHandler for Overlap {
        async fn handle_batch(&self, batch: &Batch) -> Result<(), UpstreamError> {
            use std::sync::atomic::Ordering;
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.texts.lock().push(batch.text.clone());
            tokio::time::sleep(Duration::from_secs(20 * 60)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_keeps_conversation_busy() {
        use std::sync::atomic::Ordering;

        let handler = Arc::new(Overlap::default());
        let (batcher, store) = batcher_with(handler.clone());
        assert!(batcher.settings().busy_ttl() < Duration::from_secs(20 * 60));

        batcher.push("c", BufferedMessage::new("1", "first")).unwrap();
        tokio::time::sleep(Duration::from_secs(11 * 60)).await;
        assert!(store.is_busy("c").await.unwrap(), "flag outlives its initial TTL");

        batcher.push("c", BufferedMessage::new("2", "second")).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handler.peak.load(Ordering::SeqCst), 1);
        assert_eq!(store.buffer_len("c").await.unwrap(), 1);

        // The first run finishes at 20 minutes and its settle recheck picks up
        // the waiting message
        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        assert_eq!(*handler.texts.lock(), vec!["first".to_string(), "second".to_string()]);
        assert_eq!(handler.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_handler_receives_joined_text() {
        use crate::executor::MockExecutor;

        let mut executor = MockExecutor::new();
        executor
            .expect_execute()
            .withf(|subject, payload| subject.to_string() == "conv" && payload["text"] == "a\nb")
            .times(1)
            .returning(|_, _| Ok(Value::Null));
        let store = Arc::new(MemoryStore::new());
        let batcher = ConversationBatcher::with_executor(store, Arc::new(executor), BatcherSettings::default());

        batcher.push("conv", BufferedMessage::new("1", "a")).unwrap();
        batcher.push("conv", BufferedMessage::new("2", "b")).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        batcher.shutdown().await;
    }
}
