//! Subscriber: drives the consume loop and binds incoming envelopes to
//! free workers.

pub mod dispatcher;

pub use dispatcher::{TaskFuture, WorkerDispatcher, WorkerSlot};

use crate::execution::{Disposition, Processor};
use crate::transport::{ConsumeOption, InboundEnvelope, Queue, Transport, TransportError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Subscriber tuning knobs.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Hard ceiling of concurrent message turns; also the consume prefetch.
    pub max_tasks_in_progress: usize,
    /// Per-message processing deadline.
    pub package_processing_max_time: Duration,
    /// Bound on the graceful drain during shutdown.
    pub graceful_shutdown_timeout: Duration,
    /// How long an obtained worker waits for a message before returning to
    /// the pool.
    pub schedule_timeout: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            max_tasks_in_progress: 100,
            package_processing_max_time: Duration::from_secs(60),
            graceful_shutdown_timeout: Duration::from_secs(120),
            schedule_timeout: Duration::from_secs(3),
        }
    }
}

impl SubscriberConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tasks_in_progress(mut self, n: usize) -> Self {
        self.max_tasks_in_progress = n;
        self
    }

    pub fn with_package_processing_max_time(mut self, timeout: Duration) -> Self {
        self.package_processing_max_time = timeout;
        self
    }

    pub fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    pub fn with_schedule_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_timeout = timeout;
        self
    }
}

/// One-way subscriber lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Idle,
    Running,
    Draining,
    Disconnected,
}

/// Errors from running the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    /// A stopped subscriber is not re-startable.
    #[error("subscriber was already started")]
    AlreadyStarted,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Pulls broker messages, enforces the concurrency ceiling and drives
/// orderly shutdown.
pub struct Subscriber {
    transport: Arc<dyn Transport>,
    processor: Arc<dyn Processor>,
    dispatcher: WorkerDispatcher,
    config: SubscriberConfig,
    state: Mutex<SubscriberState>,
}

impl Subscriber {
    pub fn new(
        transport: Arc<dyn Transport>,
        processor: Arc<dyn Processor>,
        config: SubscriberConfig,
    ) -> Self {
        let dispatcher = WorkerDispatcher::new(config.max_tasks_in_progress);
        Self {
            transport,
            processor,
            dispatcher,
            config,
            state: Mutex::new(SubscriberState::Idle),
        }
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.lock()
    }

    pub fn busy_workers(&self) -> usize {
        self.dispatcher.busy_workers()
    }

    /// Run the consume loop until the token is cancelled or an OS signal
    /// arrives, then drain gracefully and disconnect.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        queues: Vec<Queue>,
    ) -> Result<(), SubscriberError> {
        {
            let mut state = self.state.lock();
            if *state != SubscriberState::Idle {
                return Err(SubscriberError::AlreadyStarted);
            }
            *state = SubscriberState::Running;
        }

        info!(queues = ?queues.iter().map(|q| q.name.as_str()).collect::<Vec<_>>(),
            "subscriber started");

        let consumer_cancel = cancel.child_token();
        let prefetch = u16::try_from(self.config.max_tasks_in_progress).unwrap_or(u16::MAX);
        let mut packages = self
            .transport
            .consume(
                &queues,
                &[ConsumeOption::PrefetchCount(prefetch)],
                consumer_cancel.clone(),
            )
            .await?;

        self.dispatcher.start(consumer_cancel.clone());

        let mut signal = std::pin::pin!(shutdown_signal());

        loop {
            let slot = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("subscriber context was cancelled");
                    break;
                }
                _ = &mut signal => {
                    info!("received termination signal");
                    break;
                }
                slot = self.dispatcher.obtain() => match slot {
                    Some(slot) => slot,
                    None => {
                        info!("worker pool channel closed");
                        break;
                    }
                },
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("subscriber context was cancelled");
                    break;
                }
                _ = &mut signal => {
                    info!("received termination signal");
                    break;
                }
                _ = tokio::time::sleep(self.config.schedule_timeout) => {
                    debug!(
                        timeout = ?self.config.schedule_timeout,
                        "worker waited for a job; returning it to the pool"
                    );
                    self.dispatcher.release(slot).await;
                }
                envelope = packages.recv() => match envelope {
                    Some(envelope) => {
                        let processor = Arc::clone(&self.processor);
                        let deadline = self.config.package_processing_max_time;
                        slot.submit(Box::pin(async move {
                            process_package(processor, deadline, envelope).await;
                        }));
                    }
                    None => {
                        info!("consume channel closed");
                        break;
                    }
                },
            }
        }

        consumer_cancel.cancel();
        self.stop().await
    }

    /// Drain in-flight turns, polling at 1 Hz and bounded by the graceful
    /// shutdown timeout, then disconnect the transport.
    pub async fn stop(&self) -> Result<(), SubscriberError> {
        {
            let mut state = self.state.lock();
            match *state {
                SubscriberState::Disconnected => return Ok(()),
                _ => *state = SubscriberState::Draining,
            }
        }

        if self.dispatcher.busy_workers() > 0 {
            info!(
                in_flight = self.dispatcher.busy_workers(),
                "graceful shutdown: waiting for tasks in progress"
            );
        }

        let drained = tokio::time::timeout(self.config.graceful_shutdown_timeout, async {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.tick().await;
            while self.dispatcher.busy_workers() > 0 {
                ticker.tick().await;
                debug!(
                    in_flight = self.dispatcher.busy_workers(),
                    "waiting for remaining tasks"
                );
            }
        })
        .await;

        // Disconnect runs under the same shutdown context: if the drain
        // deadline already expired, the token arrives cancelled and the
        // transport may skip its orderly teardown.
        let shutdown_cancel = CancellationToken::new();
        if drained.is_err() {
            warn!("graceful shutdown deadline expired with tasks still in flight");
            shutdown_cancel.cancel();
        } else {
            info!("all tasks finished, disconnecting from transport");
        }

        let result = self.transport.disconnect(&shutdown_cancel).await;
        *self.state.lock() = SubscriberState::Disconnected;
        result.map_err(SubscriberError::from)
    }
}

/// Process one package under the per-message deadline, then settle the
/// envelope according to the outcome. The turn token is cancelled when
/// the deadline expires so blocking operations inside the turn stop.
async fn process_package(
    processor: Arc<dyn Processor>,
    deadline: Duration,
    envelope: Box<dyn InboundEnvelope>,
) {
    let turn_cancel = CancellationToken::new();
    match tokio::time::timeout(deadline, processor.process(envelope.as_ref(), &turn_cancel)).await
    {
        Ok(Ok(())) => {
            if let Err(err) = envelope.ack().await {
                error!(uid = envelope.uid(), error = %err, "failed to ack package");
            }
        }
        Ok(Err(err)) => match err.disposition() {
            Disposition::Ack => {
                warn!(uid = envelope.uid(), origin = envelope.origin(), error = %err,
                    "package consumed without effect");
                if let Err(ack_err) = envelope.ack().await {
                    error!(uid = envelope.uid(), error = %ack_err, "failed to ack package");
                }
            }
            Disposition::Reject => {
                error!(uid = envelope.uid(), origin = envelope.origin(), error = %err,
                    "rejecting package");
                if let Err(reject_err) = envelope.reject(false).await {
                    error!(uid = envelope.uid(), error = %reject_err, "failed to reject package");
                }
            }
            Disposition::Leave => {
                error!(uid = envelope.uid(), origin = envelope.origin(), error = %err,
                    "error processing package; leaving it for redelivery");
            }
        },
        Err(_) => {
            turn_cancel.cancel();
            error!(
                uid = envelope.uid(),
                origin = envelope.origin(),
                ?deadline,
                "package processing exceeded its deadline"
            );
        }
    }
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_the_contract() {
        let config = SubscriberConfig::default();
        assert_eq!(config.max_tasks_in_progress, 100);
        assert_eq!(config.package_processing_max_time, Duration::from_secs(60));
        assert_eq!(config.graceful_shutdown_timeout, Duration::from_secs(120));
        assert_eq!(config.schedule_timeout, Duration::from_secs(3));
    }

    #[test]
    fn config_builder_overrides() {
        let config = SubscriberConfig::new()
            .with_max_tasks_in_progress(4)
            .with_package_processing_max_time(Duration::from_millis(500))
            .with_graceful_shutdown_timeout(Duration::from_secs(5))
            .with_schedule_timeout(Duration::from_millis(50));

        assert_eq!(config.max_tasks_in_progress, 4);
        assert_eq!(config.package_processing_max_time, Duration::from_millis(500));
        assert_eq!(config.graceful_shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.schedule_timeout, Duration::from_millis(50));
    }
}
