//! # Ingestion Pipeline
//!
//! The component chain that moves device telemetry from the broker to
//! dashboard clients:
//!
//! ```text
//! broker -> subscriber -> normalizer worker -> relay -> event bus -> push gateway -> clients
//! ```
//!
//! plus the side path used by read-heavy HTTP handlers:
//!
//! ```text
//! handler -> task dispatcher -> query executor worker -> store
//! ```
//!
//! - **`model`**: message kinds, inbound payload shapes, normalized events and envelopes.
//! - **`images`**: device/date partitioned image storage.
//! - **`normalizer`**: parse, persist and project one message; runs on its own thread.
//! - **`subscriber`**: the MQTT connection and ordered forwarding to the normalizer.
//! - **`event_bus`**: synchronous in-process publish/subscribe.
//! - **`push_gateway`**: tracked client connections, liveness sweeps and fan-out.
//! - **`query_executor`**: named-placeholder queries on a dedicated thread.
//! - **`dispatcher`**: named task routing, owner of the query executor.
//! - **`admission`**: rejects duplicate in-flight requests.

#![forbid(unsafe_code)]

pub mod admission;
pub mod dispatcher;
pub mod event_bus;
pub mod images;
pub mod model;
pub mod normalizer;
pub mod push_gateway;
pub mod query_executor;
pub mod subscriber;

// --- Public API Re-exports ---
pub use admission::{AdmissionConflict, AdmissionGuard, AdmissionPermit};
pub use dispatcher::{EXECUTE_QUERY, TaskDispatcher, TaskError};
pub use event_bus::{EventBus, NEW_EVENT, SubscriptionHandle};
pub use images::ImageStorage;
pub use model::{BroadcastEnvelope, DeviceToken, MessageKind, NormalizedEvent, RawMessage};
pub use normalizer::{NormalizationError, NormalizationStage, Normalizer, NormalizerHandle, spawn_normalizer};
pub use push_gateway::{PushGateway, Registration};
pub use query_executor::{QueryError, QueryExecutorHandle};
pub use subscriber::{BrokerOptions, BrokerSubscriber, ConnectionError};
