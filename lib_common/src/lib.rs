//! Shared library for the telemetry ingestion service.
//!
//! Modules are feature gated so that consumers only compile what they use:
//! `connections` brings the store contract and its implementations, and
//! `pipeline` (the default) brings the ingestion and broadcast components.

#[cfg(feature = "connections")]
pub mod connections;

#[cfg(feature = "pipeline")]
pub mod pipeline;
