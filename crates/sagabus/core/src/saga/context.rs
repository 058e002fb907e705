//! Per-turn context handed to saga code.

use super::instance::SagaInstance;
use super::status::{SagaStatus, StatusError};
use crate::endpoint::DeliveryOptions;
use crate::registry::{BoxedPayload, Contract};

/// A message the saga wishes to emit during the current turn.
///
/// Deliveries are buffered in submission order; the handler sends them and
/// records them into history after the saga code returns.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: BoxedPayload,
    pub options: DeliveryOptions,
}

/// Grants saga code access to the current instance and an outbound
/// delivery buffer for the duration of one turn.
#[derive(Debug)]
pub struct SagaContext<'a> {
    instance: &'a mut SagaInstance,
    deliveries: Vec<Delivery>,
}

impl<'a> SagaContext<'a> {
    pub(crate) fn new(instance: &'a mut SagaInstance) -> Self {
        Self {
            instance,
            deliveries: Vec::new(),
        }
    }

    pub fn uid(&self) -> &str {
        self.instance.uid()
    }

    pub fn parent_uid(&self) -> Option<&str> {
        self.instance.parent_uid()
    }

    pub fn status(&self) -> SagaStatus {
        self.instance.status()
    }

    /// Mark the instance completed (terminal).
    pub fn complete(&mut self) -> Result<(), StatusError> {
        self.instance.complete()
    }

    /// Mark the instance failed (terminal).
    pub fn fail(&mut self) -> Result<(), StatusError> {
        self.instance.fail()
    }

    /// Switch the instance into compensation.
    pub fn compensate(&mut self) -> Result<(), StatusError> {
        self.instance.compensate()
    }

    /// Buffer a delivery with default options.
    pub fn dispatch<T: Contract>(&mut self, payload: T) {
        self.dispatch_boxed(Box::new(payload), DeliveryOptions::default());
    }

    /// Buffer a delivery with explicit options.
    pub fn dispatch_with<T: Contract>(&mut self, payload: T, options: DeliveryOptions) {
        self.dispatch_boxed(Box::new(payload), options);
    }

    pub fn dispatch_boxed(&mut self, payload: BoxedPayload, options: DeliveryOptions) {
        self.deliveries.push(Delivery { payload, options });
    }

    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }

    pub(crate) fn take_deliveries(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.deliveries)
    }
}
