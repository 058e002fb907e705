//! Demo saga and event types used by the integration scenarios.

use async_trait::async_trait;
use dashmap::DashMap;
use sagabus_core::registry::{BoxedPayload, Contract, GroupKind, TypeRegistry, payload_downcast};
use sagabus_core::saga::{Saga, SagaContext, SagaResult, register_system_contracts};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Group of the demo contracts.
pub const DEMO_GROUP: &str = "demo";

/// Demo saga: completes on [`FooEvent`], runs a timed step on
/// [`SlowEvent`], and fails on [`FlakyEvent`] while its per-instance fuse
/// is armed.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Foo {
    pub x: i64,
}

impl Contract for Foo {
    const GROUP: &'static str = DEMO_GROUP;
    const KIND: &'static str = "Foo";
}

/// Drives the demo saga to completion.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FooEvent;

impl Contract for FooEvent {
    const GROUP: &'static str = DEMO_GROUP;
    const KIND: &'static str = "FooEvent";
}

/// Registered but deliberately absent from the demo saga's handler table.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarEvent;

impl Contract for BarEvent {
    const GROUP: &'static str = DEMO_GROUP;
    const KIND: &'static str = "BarEvent";
}

/// Holds a worker for the given time, then completes the saga.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowEvent {
    pub millis: u64,
}

impl Contract for SlowEvent {
    const GROUP: &'static str = DEMO_GROUP;
    const KIND: &'static str = "SlowEvent";
}

/// Fails while the instance's fuse (see [`arm_flaky`]) is armed, then
/// completes on redelivery.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlakyEvent;

impl Contract for FlakyEvent {
    const GROUP: &'static str = DEMO_GROUP;
    const KIND: &'static str = "FlakyEvent";
}

#[async_trait]
impl Saga for Foo {
    fn init(&mut self) {}

    fn event_handlers(&self) -> Vec<GroupKind> {
        vec![
            <FooEvent as Contract>::group_kind(),
            <SlowEvent as Contract>::group_kind(),
            <FlakyEvent as Contract>::group_kind(),
        ]
    }

    async fn handle(&mut self, ctx: &mut SagaContext<'_>, event: BoxedPayload) -> SagaResult {
        if payload_downcast::<FooEvent>(event.as_ref()).is_some() {
            ctx.complete()?;
            return Ok(());
        }
        if let Some(slow) = payload_downcast::<SlowEvent>(event.as_ref()) {
            gauge().enter();
            tokio::time::sleep(Duration::from_millis(slow.millis)).await;
            gauge().exit();
            ctx.complete()?;
            return Ok(());
        }
        if payload_downcast::<FlakyEvent>(event.as_ref()).is_some() {
            if take_flaky_failure(ctx.uid()) {
                return Err("armed flaky handler failure".into());
            }
            ctx.complete()?;
            return Ok(());
        }
        Ok(())
    }

    async fn start(&mut self, _ctx: &mut SagaContext<'_>) -> SagaResult {
        Ok(())
    }
}

/// Register all demo contracts (and the system contracts they ride with).
pub fn register_demo_types(registry: &TypeRegistry) {
    register_system_contracts(registry);
    registry.register_saga::<Foo>();
    registry.register::<FooEvent>();
    registry.register::<BarEvent>();
    registry.register::<SlowEvent>();
    registry.register::<FlakyEvent>();
}

/// Concurrency gauge fed by the [`SlowEvent`] handler.
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    max_seen: AtomicUsize,
}

impl ConcurrencyGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn max_seen(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.current.store(0, Ordering::SeqCst);
        self.max_seen.store(0, Ordering::SeqCst);
    }
}

/// Process-wide gauge of in-flight [`SlowEvent`] handlers.
pub fn gauge() -> &'static ConcurrencyGauge {
    static GAUGE: OnceLock<ConcurrencyGauge> = OnceLock::new();
    GAUGE.get_or_init(|| ConcurrencyGauge {
        current: AtomicUsize::new(0),
        max_seen: AtomicUsize::new(0),
    })
}

fn flaky_fuses() -> &'static DashMap<String, usize> {
    static FUSES: OnceLock<DashMap<String, usize>> = OnceLock::new();
    FUSES.get_or_init(DashMap::new)
}

/// Arm the [`FlakyEvent`] handler of `saga_uid` to fail `failures` times.
pub fn arm_flaky(saga_uid: &str, failures: usize) {
    flaky_fuses().insert(saga_uid.to_string(), failures);
}

fn take_flaky_failure(saga_uid: &str) -> bool {
    if let Some(mut remaining) = flaky_fuses().get_mut(saga_uid) {
        if *remaining > 0 {
            *remaining -= 1;
            return true;
        }
    }
    false
}
