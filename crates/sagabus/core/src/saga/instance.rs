//! Saga instances and their event-sourced history.

use super::Saga;
use super::status::{SagaStatus, StatusError, Transition};
use crate::registry::{BoxedPayload, GroupKind};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

/// A persisted record of an envelope the instance received or produced.
#[derive(Debug, Clone)]
pub struct HistoryEvent {
    /// Unique event id.
    pub uid: String,
    /// The recorded payload.
    pub payload: BoxedPayload,
    /// Instance status at the time the event was recorded.
    pub status: SagaStatus,
    /// Optional free-form annotation.
    pub description: String,
    /// Queue the triggering envelope was consumed from; empty for
    /// deliveries the saga emitted.
    pub origin: String,
    /// UID of the triggering envelope. Kept in memory only; the persisted
    /// schema does not carry it.
    pub trace_uid: String,
    pub created_at: DateTime<Utc>,
}

impl HistoryEvent {
    pub fn group_kind(&self) -> GroupKind {
        self.payload.group_kind()
    }
}

/// Annotations attached when recording a history event.
#[derive(Debug, Clone, Default)]
pub struct HistoryAttributes {
    origin: Option<String>,
    trace_uid: Option<String>,
    description: Option<String>,
}

impl HistoryAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_trace_uid(mut self, trace_uid: impl Into<String>) -> Self {
        self.trace_uid = Some(trace_uid.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// One concrete execution of a saga.
///
/// The store owns instances; the handler borrows one for the duration of a
/// single message turn under the distributed mutex. The saga behavior
/// object is detachable (`take_saga`/`put_saga`) so a handler can run it
/// against a context borrowing the rest of the instance.
#[derive(Debug)]
pub struct SagaInstance {
    uid: String,
    parent_uid: Option<String>,
    saga: Option<Box<dyn Saga>>,
    status: SagaStatus,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    history: Vec<HistoryEvent>,
}

impl SagaInstance {
    /// New instance in `Created` status.
    pub fn new(uid: impl Into<String>, parent_uid: Option<String>, saga: Box<dyn Saga>) -> Self {
        let now = Utc::now();
        Self {
            uid: uid.into(),
            parent_uid,
            saga: Some(saga),
            status: SagaStatus::Created,
            started_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    /// Rebuild an instance from persisted state. Used by stores.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        uid: String,
        parent_uid: Option<String>,
        saga: Box<dyn Saga>,
        status: SagaStatus,
        started_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        history: Vec<HistoryEvent>,
    ) -> Self {
        Self {
            uid,
            parent_uid,
            saga: Some(saga),
            status,
            started_at,
            updated_at,
            history,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn parent_uid(&self) -> Option<&str> {
        self.parent_uid.as_deref()
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn history(&self) -> &[HistoryEvent] {
        &self.history
    }

    /// The registered kind of the saga payload, used for reflective
    /// reconstruction by the store.
    pub fn name(&self) -> Option<GroupKind> {
        self.saga.as_ref().map(|s| s.group_kind())
    }

    /// The saga behavior object, unless currently detached for a turn.
    pub fn saga(&self) -> Option<&dyn Saga> {
        self.saga.as_deref()
    }

    /// Detach the saga object for handler dispatch.
    pub fn take_saga(&mut self) -> Option<Box<dyn Saga>> {
        self.saga.take()
    }

    /// Reattach the saga object after handler dispatch.
    pub fn put_saga(&mut self, saga: Box<dyn Saga>) {
        self.saga = Some(saga);
    }

    pub fn start(&mut self) -> Result<(), StatusError> {
        self.transition(Transition::Start)
    }

    pub fn progress(&mut self) -> Result<(), StatusError> {
        self.transition(Transition::Progress)
    }

    pub fn complete(&mut self) -> Result<(), StatusError> {
        self.transition(Transition::Complete)
    }

    pub fn fail(&mut self) -> Result<(), StatusError> {
        self.transition(Transition::Fail)
    }

    pub fn compensate(&mut self) -> Result<(), StatusError> {
        self.transition(Transition::Compensate)
    }

    pub fn recover(&mut self) -> Result<(), StatusError> {
        self.transition(Transition::Recover)
    }

    fn transition(&mut self, via: Transition) -> Result<(), StatusError> {
        self.status = self.status.apply(via)?;
        self.touch();
        Ok(())
    }

    /// Append an event to the history, tagged with the current status.
    ///
    /// `created_at` is clamped strictly above the previous event so history
    /// ordering stays monotonic per instance even within one clock tick.
    pub fn record_history(&mut self, payload: BoxedPayload, attrs: HistoryAttributes) {
        let mut created_at = Utc::now();
        if let Some(last) = self.history.last() {
            if created_at <= last.created_at {
                created_at = last.created_at + ChronoDuration::microseconds(1);
            }
        }

        self.history.push(HistoryEvent {
            uid: Uuid::new_v4().to_string(),
            payload,
            status: self.status,
            description: attrs.description.unwrap_or_default(),
            origin: attrs.origin.unwrap_or_default(),
            trace_uid: attrs.trace_uid.unwrap_or_default(),
            created_at,
        });
        self.touch();
    }

    fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}
