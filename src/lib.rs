//! Edge telemetry bridge for industrial field devices.
//!
//! The pipeline has four resilient stages: a field collector holding
//! long-lived OPC UA subscriptions, a per-asset streaming analytics
//! engine, a durable size-capped SQLite buffer, and an upload pump that
//! ships acknowledged batches to InfluxDB. Data survives cloud outages,
//! restarts, and disk pressure; delivery is at-least-once, absorbed
//! remotely by idempotent point identity.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod analytics;
pub mod app;
pub mod buffer;
pub mod config;
pub mod event;
pub mod sinks;
pub mod sources;

#[cfg(test)]
mod test_util;
