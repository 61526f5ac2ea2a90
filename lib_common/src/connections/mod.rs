//! # Connections Module
//!
//! Persistence for the ingestion pipeline: the row shapes written to the
//! telemetry tables, the store contract the normalizer and query executor
//! depend on, and its two implementations.

/// Row types for the telemetry, case-tracking and settings tables.
pub mod records;

/// The `TelemetryStore` contract and the in-memory store used by tests.
pub mod store;

/// PostgreSQL-backed store built on a deadpool connection pool.
pub mod db_postgres;

pub use db_postgres::PgTelemetryStore;
pub use records::*;
pub use store::{MemoryStore, StoreError, TelemetryStore};
