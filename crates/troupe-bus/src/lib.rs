//! # troupe-bus
//!
//! The bus layer of the troupe platform:
//!
//! - **[`client`]** -- the agent-agnostic [`Bus`] trait and the Redis
//!   pub/sub implementation with automatic reconnection
//! - **[`correlation`]** -- the [`RequestTracker`] that turns pub/sub
//!   into a request/reply calling convention with deadlines
//! - **[`memory`]** (feature `test-utils`) -- an in-process bus with the
//!   same delivery semantics, for integration tests

pub mod client;
pub mod correlation;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use client::{handler, Bus, BusError, Handler, RedisBus};
pub use correlation::{PendingRequest, RequestError, RequestTracker};

#[cfg(any(test, feature = "test-utils"))]
pub use memory::InMemoryBus;
