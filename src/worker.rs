//! The queue polling loop and per-message dispatch.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cleanup::LocalCleanup;
use crate::error::WorkerError;
use crate::gate::ConcurrencyGate;
use crate::lock::DedupGate;
use crate::message::QueueMessage;
use crate::pipeline::ConversionPipeline;
use crate::queue::{MessageQueue, ReceivedMessage};
use crate::telemetry::{self, MessageReport};

/// Wait time used while messages are flowing.
pub const FAST_POLL_WAIT: Duration = Duration::from_secs(1);

/// Adaptive poll state: drain quickly while batches arrive, long-poll otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    Fast,
    Slow,
}

impl PollMode {
    /// Receive wait time for this mode, given the configured maximum.
    pub fn wait_time(self, max_wait: Duration) -> Duration {
        match self {
            Self::Fast => FAST_POLL_WAIT.min(max_wait),
            Self::Slow => max_wait,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Slow => "slow",
        }
    }
}

impl fmt::Display for PollMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receive parameters and per-message defaults.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_messages: i32,
    pub visibility_timeout: Duration,
    /// Wait time of slow polls.
    pub max_wait_time: Duration,
    /// Destination prefix used when a message carries no subfolder.
    pub destination_prefix: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_messages: 10,
            visibility_timeout: Duration::from_secs(30),
            max_wait_time: Duration::from_secs(20),
            destination_prefix: "pdf/".to_string(),
        }
    }
}

/// Runs one admitted message through the pipeline and settles it with the queue.
struct MessageHandler {
    queue: Arc<dyn MessageQueue>,
    dedup: DedupGate,
    pipeline: Arc<ConversionPipeline>,
    destination_prefix: String,
}

impl MessageHandler {
    async fn handle(&self, raw: ReceivedMessage) {
        let started = Instant::now();
        let (message, outcome) = match QueueMessage::parse(&raw) {
            Ok(message) => {
                let outcome = self.run(&message).await;
                (Some(message), outcome)
            }
            Err(e) => (None, Err(e)),
        };

        match &outcome {
            Ok(_) => match self.queue.delete(&raw.receipt_handle).await {
                Ok(()) => debug!(message_id = %raw.message_id, "Message acknowledged"),
                Err(e) => warn!(message_id = %raw.message_id, error = %format!("{e:#}"), "Failed to delete message"),
            },
            Err(e) => {
                error!(message_id = %raw.message_id, error = %e, "Message processing failed");
                if let Err(e) = self.dedup.reject(&raw.message_id).await {
                    error!(message_id = %raw.message_id, error = %format!("{e:#}"), "Failed to release dedup lock");
                }
            }
        }

        let message = message.as_ref();
        telemetry::record_message_telemetry(&MessageReport {
            message_id: &raw.message_id,
            template: message.map(|m| m.attributes.template_ref.as_str()),
            requests: *outcome.as_ref().unwrap_or(&0),
            duration: started.elapsed(),
            trace_parent: message.and_then(|m| m.attributes.trace_parent.as_deref()),
            error: outcome.as_ref().err(),
        });
    }

    /// Returns the number of documents produced.
    async fn run(&self, message: &QueueMessage) -> Result<usize, WorkerError> {
        let request = message.to_request();
        let options = message.to_options(&self.destination_prefix);
        info!(
            message_id = %message.id,
            template = %message.attributes.template_ref,
            request = %request.name,
            "Processing message"
        );

        let results = self
            .pipeline
            .process(&message.attributes.template_ref, &[request], &options)
            .await?;

        let failed = results.iter().filter(|r| !r.is_success()).count();
        if failed > 0 {
            return Err(WorkerError::RequestsFailed {
                failed,
                total: results.len(),
            });
        }
        Ok(results.len())
    }
}

/// Releases the dedup lock of a message whose task unwinds before settling it.
struct SettleGuard {
    dedup: DedupGate,
    tracker: TaskTracker,
    message_id: String,
    settled: bool,
}

impl SettleGuard {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let dedup = self.dedup.clone();
        let message_id = std::mem::take(&mut self.message_id);
        warn!(message_id = %message_id, "Message task aborted, releasing dedup lock");
        self.tracker.spawn_on(
            async move {
                if let Err(e) = dedup.reject(&message_id).await {
                    error!(message_id = %message_id, error = %format!("{e:#}"), "Failed to release dedup lock");
                }
            },
            &runtime,
        );
    }
}

/// Polls the queue and dispatches admitted messages onto bounded concurrent tasks.
pub struct QueueWorker {
    queue: Arc<dyn MessageQueue>,
    dedup: DedupGate,
    gate: ConcurrencyGate,
    handler: Arc<MessageHandler>,
    cleanup: LocalCleanup,
    settings: WorkerSettings,
    tracker: TaskTracker,
    mode: PollMode,
    last_cleanup: Instant,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        dedup: DedupGate,
        gate: ConcurrencyGate,
        pipeline: Arc<ConversionPipeline>,
        cleanup: LocalCleanup,
        settings: WorkerSettings,
    ) -> Self {
        let handler = Arc::new(MessageHandler {
            queue: queue.clone(),
            dedup: dedup.clone(),
            pipeline,
            destination_prefix: settings.destination_prefix.clone(),
        });
        Self {
            queue,
            dedup,
            gate,
            handler,
            cleanup,
            settings,
            tracker: TaskTracker::new(),
            mode: PollMode::Slow,
            last_cleanup: Instant::now(),
        }
    }

    pub fn mode(&self) -> PollMode {
        self.mode
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Polls until `shutdown` is cancelled, then waits for in-flight messages.
    ///
    /// Errors inside an iteration are logged and only switch the worker to slow polling.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            gate_size = self.gate.size(),
            max_messages = self.settings.max_messages,
            "Queue worker started"
        );

        while !shutdown.is_cancelled() {
            self.poll(&shutdown).await;
        }

        info!(in_flight = self.tracker.len(), "Shutdown requested, draining in-flight messages");
        self.tracker.close();
        self.tracker.wait().await;
        info!("Queue worker stopped");
    }

    /// Runs a single poll iteration and returns the next poll mode.
    pub async fn poll_once(&mut self) -> PollMode {
        self.poll(&CancellationToken::new()).await
    }

    /// Waits until every dispatched message has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    async fn poll(&mut self, shutdown: &CancellationToken) -> PollMode {
        let wait_time = self.mode.wait_time(self.settings.max_wait_time);
        let received = tokio::select! {
            _ = shutdown.cancelled() => return self.mode,
            received = self.queue.receive(
                self.settings.max_messages,
                self.settings.visibility_timeout,
                wait_time,
            ) => received,
        };

        self.mode = match received {
            Ok(Some(batch)) => {
                telemetry::record_poll_heartbeat(batch.len(), PollMode::Fast);
                match self.dispatch(batch).await {
                    Ok(()) => PollMode::Fast,
                    Err(e) => {
                        error!(error = %e, "Failed to dispatch batch");
                        PollMode::Slow
                    }
                }
            }
            Ok(None) => {
                debug!(waited = ?wait_time, "No messages received");
                self.last_cleanup = self.cleanup.run_if_due(self.last_cleanup).await;
                PollMode::Slow
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "Failed to receive messages");
                PollMode::Slow
            }
        };
        self.mode
    }

    async fn dispatch(&self, batch: Vec<ReceivedMessage>) -> Result<(), WorkerError> {
        for message in batch {
            let admitted = self
                .dedup
                .admit(&message.message_id)
                .await
                .map_err(|e| WorkerError::infrastructure("dedup admission failed", e))?;
            if !admitted {
                debug!(message_id = %message.message_id, "Message owned elsewhere, skipping");
                continue;
            }

            let permit = match self.gate.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    if let Err(e) = self.dedup.reject(&message.message_id).await {
                        warn!(error = %format!("{e:#}"), "Failed to release dedup lock");
                    }
                    return Err(WorkerError::Infrastructure {
                        message: "concurrency gate closed".to_string(),
                        source: Some(Box::new(e)),
                    });
                }
            };

            let handler = self.handler.clone();
            let guard = SettleGuard {
                dedup: self.dedup.clone(),
                tracker: self.tracker.clone(),
                message_id: message.message_id.clone(),
                settled: false,
            };
            self.tracker.spawn(async move {
                handler.handle(message).await;
                guard.settle();
                drop(permit);
            });
        }
        Ok(())
    }
}
