//! # sagabus-testing
//!
//! Testing utilities for the saga engine: [`InMemorySagaStore`] and
//! [`InMemoryMutex`] implementing the core ports, demo saga fixtures and a
//! [`TestHarness`] wiring a full engine over the in-process transport.

pub mod fixtures;
pub mod harness;
pub mod memory_mutex;
pub mod memory_store;

#[cfg(test)]
mod scenarios;

pub use fixtures::{BarEvent, FlakyEvent, Foo, FooEvent, SlowEvent, register_demo_types};
pub use harness::{
    COMPLETED_QUEUE, COMPLETED_TOPIC, MAIN_QUEUE, MAIN_TOPIC, PARENT_QUEUE, PARENT_TOPIC,
    TestHarness, init_test_logging,
};
pub use memory_mutex::InMemoryMutex;
pub use memory_store::InMemorySagaStore;
