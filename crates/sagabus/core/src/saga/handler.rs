//! Saga events handler: one event turn per incoming envelope.

use super::contracts::{SagaChildCompletedEvent, SagaCompletedEvent};
use super::context::Delivery;
use super::instance::{HistoryAttributes, SagaInstance};
use super::mutex::{HeldLock, SagaMutex};
use super::store::SagaStore;
use super::{SagaContext, saga_uid_from_headers, stamp_saga_uid};
use crate::endpoint::DeliveryOptions;
use crate::execution::{HandlerError, MessageExecutionCtx, MessageHandler};
use crate::message::{OutboundMessage, ReceivedMessage};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Routes saga events to their instances.
///
/// The turn for an incoming envelope:
/// locks the instance UID across replicas, loads the instance, dispatches
/// to the saga's event handler, sends the collected deliveries with the
/// incoming headers copied and `saga_uid` rewritten, appends the incoming
/// envelope and every delivery to the history, persists, and on terminal
/// `Completed` emits a `SagaCompletedEvent` (plus a child-completed
/// notification to the parent when one is set). Any failure aborts the
/// turn before persistence, so the envelope is redelivered against
/// unchanged state.
pub struct SagaEventsHandler {
    store: Arc<dyn SagaStore>,
    mutex: Arc<dyn SagaMutex>,
}

impl SagaEventsHandler {
    pub fn new(store: Arc<dyn SagaStore>, mutex: Arc<dyn SagaMutex>) -> Self {
        Self { store, mutex }
    }

    async fn run_turn(
        &self,
        ctx: &MessageExecutionCtx<'_>,
        saga_uid: &str,
        message: &ReceivedMessage,
    ) -> Result<(), HandlerError> {
        let cancel = ctx.cancellation();
        let mut instance = self
            .store
            .get_by_id(saga_uid, cancel)
            .await?
            .ok_or_else(|| HandlerError::SagaNotFound(saga_uid.to_string()))?;

        if instance.status().is_terminal() {
            return Err(HandlerError::SagaFinished {
                uid: saga_uid.to_string(),
                status: instance.status(),
            });
        }

        let mut saga = instance
            .take_saga()
            .ok_or_else(|| HandlerError::Saga("saga payload detached from instance".into()))?;
        saga.init();

        // Compensating instances keep their status through event turns;
        // everything else progresses.
        if instance.status().can_progress() {
            instance.progress()?;
        }

        let group_kind = message.group_kind();
        let deliveries;
        {
            let mut saga_ctx = SagaContext::new(&mut instance);
            if saga.event_handlers().contains(&group_kind) {
                let event = message.payload().clone_payload();
                let outcome = saga.handle(&mut saga_ctx, event).await;
                if let Err(err) = outcome {
                    instance.put_saga(saga);
                    return Err(HandlerError::Saga(err));
                }
            } else {
                warn!(
                    saga_uid,
                    %group_kind,
                    message_uid = message.uid(),
                    "no handler defined for saga event"
                );
            }
            deliveries = saga_ctx.take_deliveries();
        }
        instance.put_saga(saga);

        self.send_deliveries(ctx, &instance, message, &deliveries)
            .await?;

        // Completion announcements go out before the persist, so a send
        // failure aborts the whole turn. Only the parent notification is
        // recorded into history; the completed event is not a delivery of
        // this instance.
        let completed = instance.status().is_completed();
        let notify_parent = completed && instance.parent_uid().is_some();
        if completed {
            self.announce_completion(ctx, &instance, message).await?;
        }
        if notify_parent {
            self.notify_parent(ctx, &instance, message).await?;
        }

        instance.record_history(
            message.payload().clone_payload(),
            HistoryAttributes::new()
                .with_origin(message.origin())
                .with_trace_uid(message.uid()),
        );
        for delivery in deliveries {
            instance.record_history(delivery.payload, HistoryAttributes::new());
        }
        if notify_parent {
            if let Some(parent_uid) = instance.parent_uid().map(str::to_string) {
                instance.record_history(
                    Box::new(SagaChildCompletedEvent {
                        saga_uid: parent_uid,
                    }),
                    HistoryAttributes::new(),
                );
            }
        }

        self.store.update(&instance, cancel).await?;
        Ok(())
    }

    /// Emit the `SagaCompletedEvent` announcing this instance reached
    /// terminal `Completed`.
    async fn announce_completion(
        &self,
        ctx: &MessageExecutionCtx<'_>,
        instance: &SagaInstance,
        message: &ReceivedMessage,
    ) -> Result<(), HandlerError> {
        let mut headers = message.headers().clone();
        stamp_saga_uid(&mut headers, instance.uid());
        let event = SagaCompletedEvent {
            saga_uid: instance.uid().to_string(),
        };
        ctx.send(
            OutboundMessage::with_headers(Box::new(event), headers),
            DeliveryOptions::default(),
        )
        .await?;
        Ok(())
    }

    async fn send_deliveries(
        &self,
        ctx: &MessageExecutionCtx<'_>,
        instance: &SagaInstance,
        message: &ReceivedMessage,
        deliveries: &[Delivery],
    ) -> Result<(), HandlerError> {
        for delivery in deliveries {
            let mut headers = message.headers().clone();
            stamp_saga_uid(&mut headers, instance.uid());
            let outbound = OutboundMessage::with_headers(delivery.payload.clone(), headers);
            ctx.send(outbound, delivery.options.clone()).await?;
        }
        Ok(())
    }

    async fn notify_parent(
        &self,
        ctx: &MessageExecutionCtx<'_>,
        instance: &SagaInstance,
        message: &ReceivedMessage,
    ) -> Result<(), HandlerError> {
        let Some(parent_uid) = instance.parent_uid() else {
            return Ok(());
        };
        let mut headers = message.headers().clone();
        stamp_saga_uid(&mut headers, parent_uid);
        let event = SagaChildCompletedEvent {
            saga_uid: parent_uid.to_string(),
        };
        ctx.send(
            OutboundMessage::with_headers(Box::new(event), headers),
            DeliveryOptions::default(),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for SagaEventsHandler {
    async fn handle(&self, ctx: MessageExecutionCtx<'_>) -> Result<(), HandlerError> {
        let message = ctx.message();
        let saga_uid = saga_uid_from_headers(message.headers())
            .ok_or_else(|| HandlerError::MissingSagaUid(message.uid().to_string()))?;

        // Single writer per saga UID across replicas. The guard releases
        // with its own bounded grace period even when the turn aborts.
        let lock =
            HeldLock::acquire(Arc::clone(&self.mutex), saga_uid.clone(), ctx.cancellation())
                .await?;
        let outcome = self.run_turn(&ctx, &saga_uid, message).await;
        lock.release().await;
        outcome
    }
}
