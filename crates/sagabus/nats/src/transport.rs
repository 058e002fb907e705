//! NATS Core transport implementation.

use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
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
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Header carrying the envelope UID across the wire.
const UID_HEADER: &str = "sagabus-uid";

/// Configuration for [`NatsTransport`].
#[derive(Debug, Clone)]
pub struct NatsTransportConfig {
    /// NATS server URL.
    pub url: String,
}

impl Default for NatsTransportConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
        }
    }
}

impl NatsTransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

/// Transport over NATS Core pub/sub.
pub struct NatsTransport {
    config: NatsTransportConfig,
    client: RwLock<Option<Client>>,
    bindings: DashMap<String, Vec<QueueBinding>>,
}

impl NatsTransport {
    pub fn new(config: NatsTransportConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            bindings: DashMap::new(),
        }
    }

    async fn client(&self) -> Result<Client, TransportError> {
        self.client
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    fn subject(topic: &str, routing_key: &str) -> String {
        if routing_key.is_empty() {
            topic.to_string()
        } else {
            format!("{topic}.{routing_key}")
        }
    }

    fn subjects_for(binding: &QueueBinding) -> Vec<String> {
        if binding.routing_keys.is_empty() {
            // Everything published to the topic, keyed or not.
            vec![binding.topic.clone(), format!("{}.>", binding.topic)]
        } else {
            binding
                .routing_keys
                .iter()
                .map(|key| Self::subject(&binding.topic, key))
                .collect()
        }
    }
}

fn to_nats_headers(headers: &Headers, uid: &str) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in headers.iter() {
        map.insert(key, value);
    }
    map.insert(UID_HEADER, uid);
    map
}

fn from_nats_headers(map: Option<&HeaderMap>) -> (Headers, String) {
    let mut headers = Headers::new();
    if let Some(map) = map {
        for (name, values) in map.iter() {
            if let Some(value) = values.first() {
                headers.set(name.to_string(), value.as_str());
            }
        }
    }
    let uid = headers
        .get(UID_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    (headers, uid)
}

#[async_trait]
impl Transport for NatsTransport {
    async fn connect(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        let mut slot = self.client.write().await;
        if slot.is_some() {
            return Ok(());
        }
        let client = tokio::select! {
            biased;
            connected = async_nats::connect(&self.config.url) => {
                connected.map_err(|e| TransportError::Backend(e.to_string()))?
            }
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        };
        *slot = Some(client);
        Ok(())
    }

    async fn disconnect(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        let client = self.client.write().await.take();
        if let Some(client) = client {
            // A cancelled shutdown context skips the orderly flush.
            if cancel.is_cancelled() {
                return Ok(());
            }
            let flushed = tokio::select! {
                biased;
                flushed = client.flush() => flushed,
                _ = cancel.cancelled() => return Ok(()),
            };
            if let Err(err) = flushed {
                warn!(error = %err, "flush on disconnect failed");
            }
        }
        Ok(())
    }

    async fn declare_topic(
        &self,
        _topic: &Topic,
        _cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        // Subjects are implicit in NATS.
        Ok(())
    }

    async fn declare_queue(
        &self,
        queue: &Queue,
        bindings: &[QueueBinding],
        _cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let mut entry = self.bindings.entry(queue.name.clone()).or_default();
        for binding in bindings {
            if !entry.contains(binding) {
                entry.push(binding.clone());
            }
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
        for option in options {
            match option {
                SendOption::Mandatory => return Err(TransportError::BadOption("mandatory")),
                SendOption::Immediate => return Err(TransportError::BadOption("immediate")),
            }
        }
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let client = self.client().await?;
        let subject = Self::subject(&destination.topic, &destination.routing_key);
        let headers = to_nats_headers(&envelope.headers, &envelope.uid);

        let delay = envelope
            .headers
            .get(DELAY_MS_HEADER)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis);

        if let Some(delay) = delay {
            let body = envelope.body;
            let delay_cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = delay_cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if let Err(err) = client
                    .publish_with_headers(subject, headers, body.into())
                    .await
                {
                    warn!(error = %err, "delayed publish failed");
                }
            });
            return Ok(());
        }

        let published = tokio::select! {
            biased;
            published = client.publish_with_headers(subject, headers, envelope.body.into()) => {
                published
            }
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        };
        published.map_err(|e| TransportError::Send {
            topic: destination.topic.clone(),
            routing_key: destination.routing_key.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn consume(
        &self,
        queues: &[Queue],
        options: &[ConsumeOption],
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<Box<dyn InboundEnvelope>>, TransportError> {
        let mut prefetch = 0u16;
        for option in options {
            match option {
                ConsumeOption::PrefetchCount(n) => prefetch = *n,
                ConsumeOption::NoWait => {}
                ConsumeOption::Exclusive => return Err(TransportError::BadOption("exclusive")),
                ConsumeOption::NoLocal => return Err(TransportError::BadOption("no_local")),
            }
        }

        let client = self.client().await?;
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Box<dyn InboundEnvelope>>();

        for queue in queues {
            let bindings = self
                .bindings
                .get(&queue.name)
                .map(|b| b.value().clone())
                .ok_or_else(|| TransportError::UnknownQueue(queue.name.clone()))?;

            let semaphore =
                (prefetch > 0).then(|| Arc::new(Semaphore::new(prefetch as usize)));

            for binding in &bindings {
                for subject in Self::subjects_for(binding) {
                    let subscription = client
                        .queue_subscribe(subject.clone(), queue.name.clone())
                        .await
                        .map_err(|e| TransportError::Consume(e.to_string()))?;

                    spawn_subject_consumer(
                        queue.name.clone(),
                        subject,
                        subscription,
                        client.clone(),
                        out_tx.clone(),
                        semaphore.clone(),
                        cancel.clone(),
                    );
                }
            }
        }

        Ok(out_rx)
    }
}

fn spawn_subject_consumer(
    queue: String,
    subject: String,
    mut subscription: async_nats::Subscriber,
    client: Client,
    out_tx: mpsc::UnboundedSender<Box<dyn InboundEnvelope>>,
    semaphore: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
) {
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
                message = subscription.next() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let (headers, uid) = from_nats_headers(message.headers.as_ref());
            let envelope = NatsEnvelope {
                uid,
                origin: queue.clone(),
                subject: subject.clone(),
                headers,
                body: message.payload.to_vec(),
                client: client.clone(),
                permit: Mutex::new(permit),
                settled: AtomicBool::new(false),
            };
            if out_tx.send(Box::new(envelope)).is_err() {
                break;
            }
        }
        if let Err(err) = subscription.unsubscribe().await {
            debug!(queue = %queue, error = %err, "unsubscribe failed");
        }
        debug!(queue = %queue, "subject consumer stopped");
    });
}

struct NatsEnvelope {
    uid: String,
    origin: String,
    subject: String,
    headers: Headers,
    body: Vec<u8>,
    client: Client,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    settled: AtomicBool,
}

impl NatsEnvelope {
    fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }

    fn release_permit(&self) {
        self.permit.lock().take();
    }

    fn republish(&self) {
        let client = self.client.clone();
        let subject = self.subject.clone();
        let headers = to_nats_headers(&self.headers, &self.uid);
        let body = self.body.clone();
        tokio::spawn(async move {
            if let Err(err) = client
                .publish_with_headers(subject, headers, body.into())
                .await
            {
                warn!(error = %err, "republish for redelivery failed");
            }
        });
    }
}

#[async_trait]
impl InboundEnvelope for NatsEnvelope {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn body(&self) -> &[u8] {
        &self.body
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
                self.republish();
            }
            self.release_permit();
        }
        Ok(())
    }
}

impl Drop for NatsEnvelope {
    fn drop(&mut self) {
        // Client-side stand-in for broker redelivery of unacked messages.
        if !self.settled.load(Ordering::SeqCst) {
            self.republish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_mapping() {
        assert_eq!(NatsTransport::subject("orders", ""), "orders");
        assert_eq!(NatsTransport::subject("orders", "placed"), "orders.placed");
    }

    #[test]
    fn empty_binding_covers_topic_and_wildcard() {
        let subjects = NatsTransport::subjects_for(&QueueBinding::new("orders", vec![]));
        assert_eq!(subjects, vec!["orders".to_string(), "orders.>".to_string()]);
    }

    #[test]
    fn keyed_binding_maps_to_keyed_subjects() {
        let binding = QueueBinding::new(
            "orders",
            vec!["placed".to_string(), "cancelled".to_string()],
        );
        assert_eq!(
            NatsTransport::subjects_for(&binding),
            vec!["orders.placed".to_string(), "orders.cancelled".to_string()]
        );
    }

    #[test]
    fn header_round_trip_keeps_uid() {
        let mut headers = Headers::new();
        headers.set("saga_uid", "s-1");

        let map = to_nats_headers(&headers, "m-1");
        let (parsed, uid) = from_nats_headers(Some(&map));

        assert_eq!(uid, "m-1");
        assert_eq!(parsed.get("saga_uid"), Some("s-1"));
    }

    #[tokio::test]
    async fn send_without_connect_fails() {
        let transport = NatsTransport::new(NatsTransportConfig::default());
        let err = transport
            .send(
                &Destination::new("t", ""),
                OutboundEnvelope {
                    uid: "m".to_string(),
                    headers: Headers::new(),
                    body: vec![],
                },
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn cancelled_send_is_refused() {
        let transport = NatsTransport::new(NatsTransportConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = transport
            .send(
                &Destination::new("t", ""),
                OutboundEnvelope {
                    uid: "m".to_string(),
                    headers: Headers::new(),
                    body: vec![],
                },
                &[],
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
    }
}
