use crate::ingest_logic::config::Config;
use lib_common::connections::{BrokerSettings, TelemetryStore};
use lib_common::pipeline::{
    BroadcastEnvelope, BrokerOptions, BrokerSubscriber, EventBus, NEW_EVENT, NormalizerHandle,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Broker options from the configuration, falling back to the stored
/// integration settings for the URL and credentials.
pub fn broker_options(config: &Config, stored: Option<BrokerSettings>) -> Option<BrokerOptions> {
    let (url, username, password) = match (&config.broker_url, stored) {
        (Some(url), _) => (
            url.clone(),
            config.broker_username.clone(),
            config.broker_password.clone(),
        ),
        (None, Some(settings)) => (
            settings.url,
            config.broker_username.clone().or(settings.username),
            config.broker_password.clone().or(settings.password),
        ),
        (None, None) => return None,
    };
    if url.trim().is_empty() {
        return None;
    }

    let mut options = BrokerOptions::new(url);
    options.username = username.filter(|u| !u.is_empty());
    options.password = password;
    options.namespace = config.topic_namespace().to_string();
    options.keep_alive = config.broker_keep_alive();
    options.reconnect_delay = config.broker_reconnect();
    Some(options)
}

pub async fn resolve_broker(config: &Config, store: &dyn TelemetryStore) -> Option<BrokerOptions> {
    let stored = if config.broker_url.is_some() {
        None
    } else {
        match store.broker_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                error!(error = %e, "Failed to read broker settings from the store");
                None
            }
        }
    };
    broker_options(config, stored)
}

/// Runs the broker subscriber until shutdown. Without broker options the
/// server keeps serving clients and only waits for shutdown.
pub async fn run(
    options: Option<BrokerOptions>,
    normalizer: NormalizerHandle,
    relay: mpsc::Sender<BroadcastEnvelope>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let Some(options) = options else {
        warn!("No broker configured, ingestion is disabled");
        let _ = shutdown.recv().await;
        return;
    };

    info!(url = %options.url, namespace = %options.namespace, "Upstream broker configured");
    if let Err(e) = BrokerSubscriber::new(options, normalizer, relay).run(shutdown).await {
        error!(error = %e, "Broker subscriber could not start");
    }
}

/// Publishes every relayed envelope on the bus as `newEvent`. Ends when all
/// relay senders are gone.
pub async fn relay_to_bus(mut relay: mpsc::Receiver<BroadcastEnvelope>, bus: Arc<EventBus<BroadcastEnvelope>>) {
    while let Some(envelope) = relay.recv().await {
        let handlers = bus.publish(NEW_EVENT, &envelope);
        debug!(event_type = %envelope.event_type, handlers, "Envelope published");
    }
    info!("Relay channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_common::connections::MemoryStore;
    use std::time::Duration;

    fn stored(url: &str) -> BrokerSettings {
        BrokerSettings {
            url: url.to_string(),
            username: Some("device-user".into()),
            password: Some("secret".into()),
        }
    }

    #[test]
    fn configured_url_wins_over_stored_settings() {
        let config = Config {
            broker_url: Some("10.0.0.1:1884".into()),
            ..Config::defaults()
        };
        let options = broker_options(&config, Some(stored("other:1883"))).unwrap();
        assert_eq!(options.url, "10.0.0.1:1884");
        assert_eq!(options.username, None);
        assert_eq!(options.keep_alive, Duration::from_secs(60));
        assert_eq!(options.reconnect_delay, Duration::from_secs(5));
    }

    #[test]
    fn stored_settings_fill_in_when_unconfigured() {
        let options = broker_options(&Config::defaults(), Some(stored("mqtt://broker:1883"))).unwrap();
        assert_eq!(options.url, "mqtt://broker:1883");
        assert_eq!(options.username.as_deref(), Some("device-user"));
        assert_eq!(options.password.as_deref(), Some("secret"));
        assert_eq!(options.namespace, "hazen");
        assert!(broker_options(&Config::defaults(), None).is_none());
        assert!(broker_options(&Config::defaults(), Some(stored(" "))).is_none());
    }

    #[tokio::test]
    async fn resolve_reads_the_store_only_without_a_configured_url() {
        let store = MemoryStore::new();
        store.set_broker_settings(stored("from-store:1883"));

        let options = resolve_broker(&Config::defaults(), &store).await.unwrap();
        assert_eq!(options.url, "from-store:1883");
    }

    #[tokio::test]
    async fn relayed_envelopes_reach_bus_subscribers() {
        let bus = Arc::new(EventBus::new());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        bus.subscribe(NEW_EVENT, move |envelope: &BroadcastEnvelope| {
            let _ = seen_tx.send(envelope.data.plate_number.clone());
        });

        let (tx, rx) = mpsc::channel(4);
        let relay = tokio::spawn(relay_to_bus(rx, bus.clone()));
        let mut envelope: BroadcastEnvelope = serde_json::from_value(serde_json::json!({
            "type": "ALPR",
            "data": {"eventType": "ALPR", "plateNumber": "XY1", "confidence": 0.5, "device": "d"}
        }))
        .unwrap();
        tx.send(envelope.clone()).await.unwrap();
        envelope.data.plate_number = "XY2".into();
        tx.send(envelope).await.unwrap();
        drop(tx);
        relay.await.unwrap();

        assert_eq!(seen_rx.recv().await.unwrap(), "XY1");
        assert_eq!(seen_rx.recv().await.unwrap(), "XY2");
    }
}
