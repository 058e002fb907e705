//! Control handler for the system saga commands.

use super::contracts::{CompensateSagaCommand, RecoverSagaCommand, StartSagaCommand};
use super::context::Delivery;
use super::instance::{HistoryAttributes, SagaInstance};
use super::mutex::{HeldLock, SagaMutex};
use super::store::{SagaStore, StoreError};
use super::{SagaContext, SagaStatus, stamp_saga_uid};
use crate::codec::group_kind_of_value;
use crate::execution::{HandlerError, MessageExecutionCtx, MessageHandler};
use crate::message::{OutboundMessage, ReceivedMessage};
use crate::registry::{TypeRegistry, payload_downcast};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Handles `StartSagaCommand`, `CompensateSagaCommand` and
/// `RecoverSagaCommand`, each as one locked turn against the store.
pub struct SagaControlHandler {
    store: Arc<dyn SagaStore>,
    mutex: Arc<dyn SagaMutex>,
    registry: Arc<TypeRegistry>,
}

impl SagaControlHandler {
    pub fn new(
        store: Arc<dyn SagaStore>,
        mutex: Arc<dyn SagaMutex>,
        registry: Arc<TypeRegistry>,
    ) -> Self {
        Self {
            store,
            mutex,
            registry,
        }
    }

    async fn handle_start(
        &self,
        ctx: &MessageExecutionCtx<'_>,
        message: &ReceivedMessage,
        command: &StartSagaCommand,
    ) -> Result<(), HandlerError> {
        let group_kind = group_kind_of_value(&command.saga)?;
        let saga = self
            .registry
            .decode_saga_value(&group_kind, command.saga.clone())?;

        let parent_uid = if command.parent_uid.is_empty() {
            None
        } else {
            Some(command.parent_uid.clone())
        };

        let mut instance = SagaInstance::new(command.saga_uid.clone(), parent_uid, saga);
        match self.store.create(&instance, ctx.cancellation()).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(uid)) => {
                // Redelivered start command. Resume only an instance that
                // never got past creation; anything further along makes
                // this a duplicate delivery to consume.
                let existing = self
                    .store
                    .get_by_id(&uid, ctx.cancellation())
                    .await?
                    .ok_or_else(|| HandlerError::SagaNotFound(uid.clone()))?;
                if existing.status() != SagaStatus::Created {
                    return Err(HandlerError::Store(StoreError::Duplicate(uid)));
                }
                info!(saga_uid = %uid, "resuming saga stuck in created status");
                instance = existing;
            }
            Err(err) => return Err(err.into()),
        }

        instance.start()?;
        self.run_hook(ctx, message, instance, Hook::Start).await
    }

    async fn handle_compensate(
        &self,
        ctx: &MessageExecutionCtx<'_>,
        message: &ReceivedMessage,
        command: &CompensateSagaCommand,
    ) -> Result<(), HandlerError> {
        let mut instance = self.load(&command.saga_uid, ctx).await?;
        instance.compensate()?;
        self.run_hook(ctx, message, instance, Hook::Compensate).await
    }

    async fn handle_recover(
        &self,
        ctx: &MessageExecutionCtx<'_>,
        message: &ReceivedMessage,
        command: &RecoverSagaCommand,
    ) -> Result<(), HandlerError> {
        let mut instance = self.load(&command.saga_uid, ctx).await?;
        instance.recover()?;
        self.run_hook(ctx, message, instance, Hook::Recover).await
    }

    async fn load(
        &self,
        saga_uid: &str,
        ctx: &MessageExecutionCtx<'_>,
    ) -> Result<SagaInstance, HandlerError> {
        let instance = self
            .store
            .get_by_id(saga_uid, ctx.cancellation())
            .await?
            .ok_or_else(|| HandlerError::SagaNotFound(saga_uid.to_string()))?;
        if instance.status().is_terminal() {
            return Err(HandlerError::SagaFinished {
                uid: saga_uid.to_string(),
                status: instance.status(),
            });
        }
        Ok(instance)
    }

    /// Run a lifecycle hook, send its deliveries, record history and
    /// persist — the shared tail of every control turn.
    async fn run_hook(
        &self,
        ctx: &MessageExecutionCtx<'_>,
        message: &ReceivedMessage,
        mut instance: SagaInstance,
        hook: Hook,
    ) -> Result<(), HandlerError> {
        let mut saga = instance
            .take_saga()
            .ok_or_else(|| HandlerError::Saga("saga payload detached from instance".into()))?;
        saga.init();

        let deliveries;
        {
            let mut saga_ctx = SagaContext::new(&mut instance);
            let outcome = match hook {
                Hook::Start => saga.start(&mut saga_ctx).await,
                Hook::Compensate => saga.compensate(&mut saga_ctx).await,
                Hook::Recover => saga.recover(&mut saga_ctx).await,
            };
            if let Err(err) = outcome {
                instance.put_saga(saga);
                return Err(HandlerError::Saga(err));
            }
            deliveries = saga_ctx.take_deliveries();
        }
        instance.put_saga(saga);

        self.send_deliveries(ctx, &instance, message, &deliveries)
            .await?;

        instance.record_history(
            message.payload().clone_payload(),
            HistoryAttributes::new()
                .with_origin(message.origin())
                .with_trace_uid(message.uid()),
        );
        for delivery in deliveries {
            instance.record_history(delivery.payload, HistoryAttributes::new());
        }

        self.store.update(&instance, ctx.cancellation()).await?;
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
}

enum Hook {
    Start,
    Compensate,
    Recover,
}

#[async_trait]
impl MessageHandler for SagaControlHandler {
    async fn handle(&self, ctx: MessageExecutionCtx<'_>) -> Result<(), HandlerError> {
        let message = ctx.message();
        let payload = message.payload();

        let saga_uid = if let Some(cmd) = payload_downcast::<StartSagaCommand>(payload) {
            cmd.saga_uid.clone()
        } else if let Some(cmd) = payload_downcast::<CompensateSagaCommand>(payload) {
            cmd.saga_uid.clone()
        } else if let Some(cmd) = payload_downcast::<RecoverSagaCommand>(payload) {
            cmd.saga_uid.clone()
        } else {
            return Err(HandlerError::UnexpectedPayload(message.group_kind()));
        };
        if saga_uid.is_empty() {
            return Err(HandlerError::MissingSagaUid(message.uid().to_string()));
        }

        let lock =
            HeldLock::acquire(Arc::clone(&self.mutex), saga_uid.clone(), ctx.cancellation())
                .await?;
        let outcome = if let Some(cmd) = payload_downcast::<StartSagaCommand>(payload) {
            self.handle_start(&ctx, message, cmd).await
        } else if let Some(cmd) = payload_downcast::<CompensateSagaCommand>(payload) {
            self.handle_compensate(&ctx, message, cmd).await
        } else if let Some(cmd) = payload_downcast::<RecoverSagaCommand>(payload) {
            self.handle_recover(&ctx, message, cmd).await
        } else {
            Err(HandlerError::UnexpectedPayload(message.group_kind()))
        };
        lock.release().await;
        outcome
    }
}
