//! # troupe-types
//!
//! Core type definitions for the troupe multi-agent platform.
//!
//! This crate is the foundation of the dependency graph -- all other
//! troupe crates depend on it. It contains:
//!
//! - **[`envelope`]** -- The [`Envelope`] wire format and channel names
//! - **[`payload`]** -- Typed payloads carried inside envelopes
//! - **[`worker`]** -- Worker supervisor state machine types
//! - **[`activity`]** -- Activity-log and log-table row types
//! - **[`config`]** -- Environment-driven service configuration

pub mod activity;
pub mod config;
pub mod envelope;
pub mod payload;
pub mod worker;

pub use envelope::{channels, Envelope, EnvelopeError, MessageType};
pub use worker::{WorkerState, WorkerStatus};
