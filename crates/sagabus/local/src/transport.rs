//! Tokio-channel transport with at-least-once delivery.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use sagabus_core::message::{DELAY_MS_HEADER, Headers};
use sagabus_core::transport::{
    ConsumeOption, Destination, InboundEnvelope, OutboundEnvelope, Queue, QueueBinding,
    SendOption, Topic, Transport, TransportError,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    uid: String,
    headers: Headers,
    body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct TopicBinding {
    queue: String,
    routing_keys: Vec<String>,
}

impl TopicBinding {
    fn matches(&self, routing_key: &str) -> bool {
        self.routing_keys.is_empty() || self.routing_keys.iter().any(|k| k == routing_key)
    }
}

struct QueueState {
    tx: mpsc::UnboundedSender<StoredMessage>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<StoredMessage>>>,
}

#[derive(Default)]
struct Inner {
    connected: AtomicBool,
    topics: DashMap<String, Vec<TopicBinding>>,
    queues: DashMap<String, QueueState>,
}

/// In-process transport.
///
/// Queues are unbounded channels; topics route to bound queues by exact
/// routing key (an empty binding key set matches everything). The prefetch
/// option is enforced with a per-queue semaphore whose permits travel with
/// the delivered envelopes, and an envelope dropped without an ack is
/// requeued — the redelivery a broker would perform on connection loss.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn target_queues(&self, destination: &Destination) -> Vec<String> {
        if let Some(bindings) = self.inner.topics.get(&destination.topic) {
            return bindings
                .iter()
                .filter(|b| b.matches(&destination.routing_key))
                .map(|b| b.queue.clone())
                .collect();
        }
        // No such topic: a queue with the destination name accepts direct
        // sends, which keeps simple point-to-point setups declaration-free.
        if self.inner.queues.contains_key(&destination.topic) {
            vec![destination.topic.clone()]
        } else {
            Vec::new()
        }
    }

    fn deliver(&self, queue: &str, message: StoredMessage) {
        if let Some(state) = self.inner.queues.get(queue) {
            let _ = state.tx.send(message);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    // Connection management and declarations complete without suspending,
    // so their tokens have nothing to interrupt.
    async fn connect(&self, _cancel: &CancellationToken) -> Result<(), TransportError> {
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self, _cancel: &CancellationToken) -> Result<(), TransportError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_topic(
        &self,
        topic: &Topic,
        _cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.inner.topics.entry(topic.name.clone()).or_default();
        Ok(())
    }

    async fn declare_queue(
        &self,
        queue: &Queue,
        bindings: &[QueueBinding],
        _cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.inner.queues.entry(queue.name.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            QueueState {
                tx,
                rx: Mutex::new(Some(rx)),
            }
        });
        for binding in bindings {
            let mut topic = self.inner.topics.entry(binding.topic.clone()).or_default();
            topic.push(TopicBinding {
                queue: queue.name.clone(),
                routing_keys: binding.routing_keys.clone(),
            });
        }
        Ok(())
    }

    async fn send(
        &self,
        destination: &Destination,
        envelope: OutboundEnvelope,
        options: &[SendOption],
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        self.ensure_connected()?;

        let mut mandatory = false;
        for option in options {
            match option {
                SendOption::Mandatory => mandatory = true,
                SendOption::Immediate => return Err(TransportError::BadOption("immediate")),
            }
        }

        let targets = self.target_queues(destination);
        if targets.is_empty() {
            if mandatory {
                return Err(TransportError::Send {
                    topic: destination.topic.clone(),
                    routing_key: destination.routing_key.clone(),
                    reason: "no queue bound for mandatory message".to_string(),
                });
            }
            debug!(
                topic = %destination.topic,
                routing_key = %destination.routing_key,
                "dropping unroutable message"
            );
            return Ok(());
        }

        let message = StoredMessage {
            uid: envelope.uid,
            headers: envelope.headers,
            body: envelope.body,
        };

        let delay = message
            .headers
            .get(DELAY_MS_HEADER)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis);

        if let Some(delay) = delay {
            let transport = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for queue in &targets {
                    transport.deliver(queue, message.clone());
                }
            });
        } else {
            for queue in &targets {
                self.deliver(queue, message.clone());
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        queues: &[Queue],
        options: &[ConsumeOption],
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<Box<dyn InboundEnvelope>>, TransportError> {
        self.ensure_connected()?;

        let mut prefetch = 0u16;
        for option in options {
            match option {
                ConsumeOption::PrefetchCount(n) => prefetch = *n,
                // Queues are single-consumer here, so exclusivity holds by
                // construction; NoWait has nothing to wait for.
                ConsumeOption::Exclusive | ConsumeOption::NoWait => {}
                ConsumeOption::NoLocal => return Err(TransportError::BadOption("no_local")),
            }
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel::<Box<dyn InboundEnvelope>>();

        for queue in queues {
            let state = self
                .inner
                .queues
                .get(&queue.name)
                .ok_or_else(|| TransportError::UnknownQueue(queue.name.clone()))?;
            let rx = state.rx.lock().take().ok_or_else(|| {
                TransportError::Consume(format!("queue {} is already being consumed", queue.name))
            })?;
            let requeue_tx = state.tx.clone();
            drop(state);

            spawn_queue_consumer(
                Arc::clone(&self.inner),
                queue.name.clone(),
                rx,
                requeue_tx,
                out_tx.clone(),
                prefetch,
                cancel.clone(),
            );
        }

        Ok(out_rx)
    }
}

fn spawn_queue_consumer(
    inner: Arc<Inner>,
    queue: String,
    mut rx: mpsc::UnboundedReceiver<StoredMessage>,
    requeue_tx: mpsc::UnboundedSender<StoredMessage>,
    out_tx: mpsc::UnboundedSender<Box<dyn InboundEnvelope>>,
    prefetch: u16,
    cancel: CancellationToken,
) {
    let semaphore = (prefetch > 0).then(|| Arc::new(Semaphore::new(prefetch as usize)));

    tokio::spawn(async move {
        loop {
            let permit = match &semaphore {
                Some(semaphore) => {
                    let acquired = tokio::select! {
                        _ = cancel.cancelled() => break,
                        permit = Arc::clone(semaphore).acquire_owned() => permit,
                    };
                    match acquired {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    }
                }
                None => None,
            };

            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let envelope = MemoryEnvelope {
                origin: queue.clone(),
                message,
                requeue_tx: requeue_tx.clone(),
                permit: Mutex::new(permit),
                settled: AtomicBool::new(false),
            };
            if out_tx.send(Box::new(envelope)).is_err() {
                break;
            }
        }
        // Hand the receiver back so buffered messages survive and a later
        // consume can reattach to the queue.
        if let Some(state) = inner.queues.get(&queue) {
            state.rx.lock().replace(rx);
        }
        debug!(queue = %queue, "queue consumer stopped");
    });
}

struct MemoryEnvelope {
    origin: String,
    message: StoredMessage,
    requeue_tx: mpsc::UnboundedSender<StoredMessage>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    settled: AtomicBool,
}

impl MemoryEnvelope {
    fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }

    fn release_permit(&self) {
        self.permit.lock().take();
    }

    fn requeue(&self) {
        let _ = self.requeue_tx.send(self.message.clone());
    }
}

#[async_trait]
impl InboundEnvelope for MemoryEnvelope {
    fn uid(&self) -> &str {
        &self.message.uid
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn headers(&self) -> &Headers {
        &self.message.headers
    }

    fn body(&self) -> &[u8] {
        &self.message.body
    }

    async fn ack(&self) -> Result<(), TransportError> {
        if self.settle() {
            self.release_permit();
        }
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        if self.settle() {
            if requeue {
                self.requeue();
            }
            self.release_permit();
        }
        Ok(())
    }
}

impl Drop for MemoryEnvelope {
    fn drop(&mut self) {
        // An envelope dropped without a verdict goes back to its queue,
        // like a broker redelivering after a lost connection.
        if !self.settled.load(Ordering::SeqCst) {
            self.requeue();
        }
    }
}
