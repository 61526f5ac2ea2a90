use crate::ingest_logic::state::AppState;
use lib_common::pipeline::{AdmissionGuard, BroadcastEnvelope, EventBus, NormalizerHandle, PushGateway};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{MissedTickBehavior, interval};
use tracing::info;

pub const PIPELINE_STATUS: &str = "pipelineStatus";

/// What the status task reads. Holds no dispatcher handle, so registering
/// it on the dispatcher creates no reference cycle.
#[derive(Clone)]
struct StatusSources {
    gateway: Arc<PushGateway>,
    bus: Arc<EventBus<BroadcastEnvelope>>,
    normalizer: NormalizerHandle,
    admission: AdmissionGuard,
}

impl StatusSources {
    fn snapshot(&self) -> Value {
        let stats = self.normalizer.stats();
        let subscriptions: Vec<Value> = self
            .bus
            .list_subscriptions()
            .into_iter()
            .map(|(event_type, handlers)| json!({ "eventType": event_type, "handlers": handlers }))
            .collect();
        json!({
            "connections": self.gateway.connection_count(),
            "normalizer": { "succeeded": stats.succeeded, "failed": stats.failed },
            "inFlightRequests": self.admission.in_flight(),
            "subscriptions": subscriptions,
        })
    }
}

/// Registers the locally handled dispatcher tasks.
pub fn register_tasks(state: &AppState) {
    let sources = StatusSources {
        gateway: state.gateway.clone(),
        bus: state.bus.clone(),
        normalizer: state.normalizer.clone(),
        admission: state.admission.clone(),
    };
    state.dispatcher.register(PIPELINE_STATUS, move |_params| {
        let sources = sources.clone();
        async move { Ok(sources.snapshot()) }
    });
}

pub async fn run(period: Duration, app_state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let mut check_interval = interval(period);
    check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Monitor service received shutdown signal.");
                break;
            }
            _ = check_interval.tick() => {
                let stats = app_state.normalizer.stats();
                info!(
                    connections = app_state.gateway.connection_count(),
                    normalized = stats.succeeded,
                    dropped = stats.failed,
                    "Pipeline status"
                );
            }
        }
    }
}
