//! Shared fixtures for the cross-component scenarios under `tests/`.

use bytes::Bytes;
use chrono::NaiveDate;
use lib_common::connections::MemoryStore;
use lib_common::pipeline::push_gateway::OutboundFrame;
use lib_common::pipeline::{
    BroadcastEnvelope, BrokerOptions, BrokerSubscriber, EventBus, ImageStorage, NEW_EVENT, Normalizer,
    PushGateway, RawMessage, Registration, spawn_normalizer,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const PARTITION_DAY: (i32, u32, u32) = (2024, 3, 1);

/// The ingestion chain wired as the server wires it, minus the broker socket
/// and the websocket transport.
pub struct PipelineHarness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<PushGateway>,
    pub bus: Arc<EventBus<BroadcastEnvelope>>,
    pub subscriber: BrokerSubscriber,
    pub images: tempfile::TempDir,
}

impl PipelineHarness {
    pub fn start() -> Self {
        let images = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(MemoryStore::new());
        let (y, m, d) = PARTITION_DAY;
        let storage = ImageStorage::with_date_source(
            images.path(),
            Arc::new(move || NaiveDate::from_ymd_opt(y, m, d).expect("valid date")),
        );
        let (normalizer, _thread) =
            spawn_normalizer(Normalizer::new(store.clone(), storage, 1), 16).expect("normalizer thread");

        let gateway = Arc::new(PushGateway::new());
        let bus = Arc::new(EventBus::new());
        gateway.attach(&bus);

        let (relay_tx, mut relay_rx) = mpsc::channel::<BroadcastEnvelope>(16);
        let relay_bus = bus.clone();
        tokio::spawn(async move {
            while let Some(envelope) = relay_rx.recv().await {
                relay_bus.publish(NEW_EVENT, &envelope);
            }
        });

        let subscriber = BrokerSubscriber::new(BrokerOptions::new("localhost"), normalizer, relay_tx);
        Self {
            store,
            gateway,
            bus,
            subscriber,
            images,
        }
    }

    /// Registers a client as if it connected from `127.0.0.1:<port>` and
    /// consumes its acknowledgement frame.
    pub async fn connect(&self, port: u16) -> Registration {
        let mut registration = self.gateway.register(SocketAddr::from(([127, 0, 0, 1], port)));
        let ack = next_json(&mut registration).await.expect("acknowledgement frame");
        assert_eq!(ack["type"], "CONNECTION_STATUS");
        registration
    }

    /// Feeds one broker message through the chain. Returns whether an
    /// envelope was relayed toward the bus.
    pub async fn ingest(&self, topic: &str, payload: &Value) -> bool {
        let bytes = serde_json::to_vec(payload).expect("serializable payload");
        self.subscriber
            .handle_message(RawMessage::new(topic, Bytes::from(bytes)))
            .await
    }
}

/// Next text frame as JSON, or `None` after a short wait with nothing queued.
pub async fn next_json(registration: &mut Registration) -> Option<Value> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), registration.outbound.recv())
            .await
            .ok()??;
        match frame {
            OutboundFrame::Text(text) => return serde_json::from_str(&text).ok(),
            OutboundFrame::Ping => continue,
            OutboundFrame::Close => return None,
        }
    }
}

/// True when nothing arrives on the connection within `wait`.
pub async fn stays_quiet(registration: &mut Registration, wait: Duration) -> bool {
    tokio::time::timeout(wait, registration.outbound.recv()).await.is_err()
}
