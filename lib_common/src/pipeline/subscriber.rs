//! # Broker Subscriber
//!
//! Owns the MQTT connection. Every publish on the device topics is handed to
//! the normalizer worker; broadcast-ready envelopes coming back are relayed,
//! unmodified, to the parent over an mpsc channel.
//!
//! The broker event loop never waits on normalization: inbound messages go into
//! an ordered queue drained by a single forwarding task, which submits the next
//! message only after the previous reply arrives. Per-topic order is therefore
//! preserved end to end. Failed messages are logged and skipped (at-most-once).
//!
//! Connection errors are logged and the loop retries after a fixed delay; the
//! process never exits because the broker is unreachable.

use std::time::Duration;

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::pipeline::model::{BroadcastEnvelope, MessageKind, RawMessage, kind_segment};
use crate::pipeline::normalizer::NormalizerHandle;

pub const DEFAULT_NAMESPACE: &str = "hazen";
pub const DEFAULT_PORT: u16 = 1883;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("broker URL is empty")]
    MissingUrl,
    #[error("invalid broker port in {0}")]
    InvalidPort(String),
    #[error("broker client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// `host[:port]`, optionally prefixed with `mqtt://` or `tcp://`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub namespace: String,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
    pub max_packet_bytes: usize,
    /// Depth of the queue between the event loop and the forwarding task.
    pub queue_depth: usize,
}

impl BrokerOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            keep_alive: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(5),
            max_packet_bytes: 16 * 1024 * 1024,
            queue_depth: 1024,
        }
    }

    /// Splits the URL into host and port.
    pub fn endpoint(&self) -> Result<(String, u16), ConnectionError> {
        let trimmed = self.url.trim();
        let bare = trimmed
            .strip_prefix("mqtt://")
            .or_else(|| trimmed.strip_prefix("tcp://"))
            .unwrap_or(trimmed)
            .trim_end_matches('/');
        if bare.is_empty() {
            return Err(ConnectionError::MissingUrl);
        }
        match bare.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConnectionError::InvalidPort(self.url.clone()))?;
                Ok((host.to_string(), port))
            }
            None => Ok((bare.to_string(), DEFAULT_PORT)),
        }
    }

    pub fn topic_filters(&self) -> Vec<String> {
        MessageKind::ALL
            .iter()
            .map(|kind| format!("{}/+/+/{}", self.namespace, kind.segment()))
            .collect()
    }

    fn mqtt_options(&self) -> Result<MqttOptions, ConnectionError> {
        let (host, port) = self.endpoint()?;
        let mut options = MqttOptions::new(client_id(), host, port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(self.max_packet_bytes, self.max_packet_bytes);
        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        Ok(options)
    }
}

/// `its_mqtt_cluster_` followed by six random hex digits.
pub fn client_id() -> String {
    format!("its_mqtt_cluster_{}", hex::encode(rand::random::<[u8; 3]>()))
}

pub struct BrokerSubscriber {
    options: BrokerOptions,
    normalizer: NormalizerHandle,
    relay: mpsc::Sender<BroadcastEnvelope>,
}

impl BrokerSubscriber {
    pub fn new(
        options: BrokerOptions,
        normalizer: NormalizerHandle,
        relay: mpsc::Sender<BroadcastEnvelope>,
    ) -> Self {
        Self {
            options,
            normalizer,
            relay,
        }
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    /// # Handle Message
    ///
    /// Normalizes one message and relays its envelope, if any. Returns whether
    /// an envelope was relayed. Failures are logged here and never propagate.
    pub async fn handle_message(&self, message: RawMessage) -> bool {
        let kind = kind_segment(&message.topic).to_string();
        trace!(topic = %message.topic, bytes = message.payload.len(), "Dispatching to normalizer");

        match self.normalizer.process(&kind, &message.topic, message.payload).await {
            Ok(outcome) => match outcome.broadcast {
                Some(envelope) => {
                    if self.relay.send(envelope).await.is_err() {
                        warn!(topic = %message.topic, "Relay receiver closed, envelope dropped");
                        return false;
                    }
                    true
                }
                None => false,
            },
            Err(e) => {
                warn!(topic = %message.topic, stage = ?e.stage(), error = %e, "Message dropped");
                false
            }
        }
    }

    /// # Run
    ///
    /// Connects, subscribes on every (re)connect, and pumps messages until the
    /// shutdown signal fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ConnectionError> {
        let options = self.options.mqtt_options()?;
        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let filters = self.options.topic_filters();
        let reconnect_delay = self.options.reconnect_delay;

        let (queue_tx, mut queue_rx) = mpsc::channel::<RawMessage>(self.options.queue_depth.max(1));
        let forwarder = tokio::spawn(async move {
            while let Some(message) = queue_rx.recv().await {
                self.handle_message(message).await;
            }
            debug!("Broker forwarding task finished");
        });

        info!(filters = ?filters, "Broker subscriber starting");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Broker subscriber received shutdown signal.");
                    let _ = client.try_disconnect();
                    break;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to broker");
                        for filter in &filters {
                            if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                                error!(filter = %filter, error = %e, "Subscribe request failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        debug!(pkid = ack.pkid, "Subscription acknowledged");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = RawMessage::new(publish.topic, Bytes::from(publish.payload));
                        if queue_tx.send(message).await.is_err() {
                            error!("Forwarding task stopped, leaving broker loop");
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, delay = ?reconnect_delay, "Broker connection error, retrying");
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = tokio::time::sleep(reconnect_delay) => {}
                        }
                    }
                }
            }
        }

        drop(queue_tx);
        if forwarder.await.is_err() {
            warn!("Broker forwarding task panicked");
        }
        info!("Broker subscriber stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::store::MemoryStore;
    use crate::pipeline::images::ImageStorage;
    use crate::pipeline::normalizer::{Normalizer, spawn_normalizer};
    use std::sync::Arc;

    #[test]
    fn endpoint_strips_scheme_and_defaults_port() {
        let mut options = BrokerOptions::new("mqtt://10.1.2.3:1884");
        assert_eq!(options.endpoint().unwrap(), ("10.1.2.3".to_string(), 1884));
        options.url = "broker.local".into();
        assert_eq!(options.endpoint().unwrap(), ("broker.local".to_string(), DEFAULT_PORT));
        options.url = "broker:abc".into();
        assert!(matches!(options.endpoint(), Err(ConnectionError::InvalidPort(_))));
        options.url = " ".into();
        assert!(matches!(options.endpoint(), Err(ConnectionError::MissingUrl)));
    }

    #[test]
    fn filters_cover_every_kind() {
        let filters = BrokerOptions::new("x").topic_filters();
        assert_eq!(
            filters,
            vec![
                "hazen/+/+/status",
                "hazen/+/+/alpr",
                "hazen/+/+/violation",
                "hazen/+/+/cropimage",
                "hazen/+/+/fullimage",
            ]
        );
    }

    #[test]
    fn client_ids_have_six_hex_digits() {
        let id = client_id();
        let suffix = id.strip_prefix("its_mqtt_cluster_").unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn only_successful_recognition_events_are_relayed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (handle, _thread) =
            spawn_normalizer(Normalizer::new(store.clone(), ImageStorage::new(tmp.path()), 1), 4).unwrap();
        let (relay_tx, mut relay_rx) = mpsc::channel(4);
        let subscriber = BrokerSubscriber::new(BrokerOptions::new("localhost"), handle, relay_tx);

        assert!(!subscriber.handle_message(RawMessage::new("hazen/v/cam/alpr", &b"{broken"[..])).await);
        assert!(!subscriber.handle_message(RawMessage::new("hazen/v/cam/status", &br#"{"status":"normal"}"#[..])).await);
        assert!(subscriber.handle_message(RawMessage::new("hazen/v/cam/alpr", &br#"{"lpData":{"lpOcr":"K9"}}"#[..])).await);

        let envelope = relay_rx.try_recv().unwrap();
        assert_eq!(envelope.data.plate_number, "K9");
        assert!(relay_rx.try_recv().is_err());
        assert_eq!(store.statuses().len(), 1);
    }
}
