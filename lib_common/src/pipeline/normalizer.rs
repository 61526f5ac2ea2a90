//! # Message Normalizer
//!
//! Turns one raw broker message into persisted records and, for recognition
//! events, a broadcast envelope. It knows nothing about the broker or the push
//! channel.
//!
//! ## Per-kind handling
//!
//! - **status**: persisted only, never broadcast.
//! - **alpr**: the nested plate and vehicle objects are flattened into the wide
//!   recognition columns; the envelope carries display fields only.
//! - **violation**: as alpr, plus the violation block. The case-tracking record
//!   is linked to the violation's generated id inside the same store write.
//! - **cropimage / fullimage**: the base64 image is written to disk first, then
//!   the storage path (never the bytes) is persisted.
//!
//! Envelopes are produced only after persistence succeeds.
//!
//! ## Worker
//!
//! [`spawn_normalizer`] runs a [`Normalizer`] on its own OS thread with its own
//! single-threaded runtime. Callers talk to it through a [`NormalizerHandle`];
//! requests are served strictly in arrival order, and every request gets
//! exactly one tagged reply, including when processing panics.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::connections::records::{
    AlprRecord, CaseDraft, DeviceStatus, ImageKind, ImageRecord, LinkedIds, RecognitionColumns,
    StatusRecord, ViolationRecord,
};
use crate::connections::store::{StoreError, TelemetryStore};
use crate::pipeline::images::ImageStorage;
use crate::pipeline::model::{
    AlprPayload, BroadcastEnvelope, DeviceToken, EnvelopeData, ImagePayload, LpData,
    MessageKind, NormalizedEvent, StatusPayload, VehicleData, ViolationPayload, iso_millis,
};

/// Initial workflow state of a freshly opened violation case.
pub const CASE_INITIAL_STATUS: &str = "pending";

/// Where in the pipeline a message failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NormalizationStage {
    Parse,
    Persist,
    Link,
    Storage,
    Dispatch,
    Worker,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum NormalizationError {
    #[error("payload could not be parsed: {0}")]
    Parse(String),
    #[error("record could not be persisted: {0}")]
    Persist(String),
    #[error("case record could not be linked to violation {violation_id}: {message}")]
    Link { violation_id: i64, message: String },
    #[error("image could not be stored: {0}")]
    Storage(String),
    #[error("unknown message kind: {0}")]
    UnknownKind(String),
    #[error("normalizer worker fault: {0}")]
    WorkerFault(String),
}

impl NormalizationError {
    pub fn stage(&self) -> NormalizationStage {
        match self {
            Self::Parse(_) => NormalizationStage::Parse,
            Self::Persist(_) => NormalizationStage::Persist,
            Self::Link { .. } => NormalizationStage::Link,
            Self::Storage(_) => NormalizationStage::Storage,
            Self::UnknownKind(_) => NormalizationStage::Dispatch,
            Self::WorkerFault(_) => NormalizationStage::Worker,
        }
    }
}

impl From<StoreError> for NormalizationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Link { violation_id, message } => Self::Link { violation_id, message },
            other => Self::Persist(other.to_string()),
        }
    }
}

/// What was written for a message.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistedRecord {
    Status { id: i64, record: StatusRecord },
    Alpr { id: i64, record: AlprRecord },
    Violation { ids: LinkedIds, record: ViolationRecord },
    Image { id: i64, kind: ImageKind, record: ImageRecord },
}

/// Successful normalization of one message.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub event: NormalizedEvent,
    pub persisted: PersistedRecord,
    pub broadcast: Option<BroadcastEnvelope>,
}

pub type NormalizeReply = Result<Outcome, NormalizationError>;

pub struct Normalizer {
    store: Arc<dyn TelemetryStore>,
    images: ImageStorage,
    case_assignee: i64,
}

impl Normalizer {
    pub fn new(store: Arc<dyn TelemetryStore>, images: ImageStorage, case_assignee: i64) -> Self {
        Self {
            store,
            images,
            case_assignee,
        }
    }

    /// # Process
    ///
    /// `kind` is the raw last topic segment. The payload is parsed before the
    /// kind is checked, so garbage on an unknown topic reports as a parse error.
    pub async fn process(&self, kind: &str, topic: &str, payload: &[u8]) -> NormalizeReply {
        let document: Value =
            serde_json::from_slice(payload).map_err(|e| NormalizationError::Parse(e.to_string()))?;
        if document.is_null() {
            return Err(NormalizationError::Parse("empty payload".to_string()));
        }

        let device = DeviceToken::from_topic(topic);
        let kind = MessageKind::from_segment(kind)
            .ok_or_else(|| NormalizationError::UnknownKind(kind.to_string()))?;

        match kind {
            MessageKind::Status => self.status(device, parse(document)?).await,
            MessageKind::Alpr => self.alpr(device, parse(document)?).await,
            MessageKind::Violation => self.violation(device, parse(document)?).await,
            MessageKind::CropImage => self.image(device, ImageKind::Crop, parse(document)?).await,
            MessageKind::FullImage => self.image(device, ImageKind::Full, parse(document)?).await,
        }
    }

    async fn status(&self, device: DeviceToken, payload: StatusPayload) -> NormalizeReply {
        let record = StatusRecord {
            device: device.as_str().to_string(),
            status: DeviceStatus::from_reported(payload.status.as_deref()),
        };
        let id = self.store.insert_status(&record).await?;
        debug!(device = %device, status = record.status.as_str(), id, "Status persisted");

        Ok(Outcome {
            event: event(MessageKind::Status, &device, None, &record)?,
            persisted: PersistedRecord::Status { id, record },
            broadcast: None,
        })
    }

    async fn alpr(&self, device: DeviceToken, payload: AlprPayload) -> NormalizeReply {
        let lp = payload.lp_data.unwrap_or_default();
        let vehicle = payload.vehicle_data.unwrap_or_default();

        let envelope = envelope(
            MessageKind::Alpr,
            &device,
            &lp,
            &vehicle,
            Display {
                violation: None,
                timestamp_ms: payload.timestamp_unix_ms,
                speed: payload.speedmph,
                direction: payload.direction.clone(),
                sitename: payload.sitename.clone(),
            },
        );

        let record = AlprRecord {
            device: device.as_str().to_string(),
            event_id: payload.event_id,
            full_image_file_name: payload.full_image_file_name,
            sitename: payload.sitename,
            timestamp_unix_ms: payload.timestamp_unix_ms,
            recognition: recognition(payload.direction, payload.lp_visible, payload.speedmph, lp, vehicle),
        };

        let id = self.store.insert_alpr(&record).await?;
        debug!(device = %device, id, plate = %envelope.data.plate_number, "ALPR persisted");

        Ok(Outcome {
            event: event(MessageKind::Alpr, &device, record.timestamp_unix_ms, &record)?,
            persisted: PersistedRecord::Alpr { id, record },
            broadcast: Some(envelope),
        })
    }

    async fn violation(&self, device: DeviceToken, payload: ViolationPayload) -> NormalizeReply {
        let alpr = payload.alpr_data.unwrap_or_default();
        let lp = alpr.lp_data.unwrap_or_default();
        let vehicle = alpr.vehicle_data.unwrap_or_default();
        let details = payload.violation_data.unwrap_or_default();
        let bb = details.bb.unwrap_or_default();
        let corner = |i: usize| bb.get(i).copied().flatten();

        let envelope = envelope(
            MessageKind::Violation,
            &device,
            &lp,
            &vehicle,
            Display {
                violation: details.violation_type.clone(),
                timestamp_ms: payload.timestamp_unix_ms,
                speed: alpr.speedmph,
                direction: alpr.direction.clone(),
                sitename: payload.sitename.clone(),
            },
        );

        let record = ViolationRecord {
            device: device.as_str().to_string(),
            event_id: payload.event_id,
            sitename: payload.sitename.clone(),
            timestamp_unix_ms: payload.timestamp_unix_ms,
            recognition: recognition(alpr.direction, alpr.lp_visible, alpr.speedmph, lp, vehicle),
            violation_bb_h: corner(0),
            violation_bb_w: corner(1),
            violation_bb_x: corner(2),
            violation_bb_y: corner(3),
            violation_c_shot_image_file_name: details.c_shot_image_file_name,
            violation_type: details.violation_type.clone(),
            violation_video_uri: details.violation_video_uri,
        };

        let case = CaseDraft {
            violation_time: payload.timestamp_unix_ms.and_then(DateTime::from_timestamp_millis),
            sitename: payload.sitename,
            violation_type: details.violation_type,
            status: CASE_INITIAL_STATUS.to_string(),
            assignee: self.case_assignee,
        };

        let ids = self.store.insert_violation(&record, case).await?;
        info!(
            device = %device,
            violation_id = ids.violation_id,
            case_id = %ids.case_id,
            "Violation persisted and case opened"
        );

        Ok(Outcome {
            event: event(MessageKind::Violation, &device, record.timestamp_unix_ms, &record)?,
            persisted: PersistedRecord::Violation { ids, record },
            broadcast: Some(envelope),
        })
    }

    async fn image(&self, device: DeviceToken, kind: ImageKind, payload: ImagePayload) -> NormalizeReply {
        let root = match self.store.image_root().await {
            Ok(Some(root)) if !root.trim().is_empty() => PathBuf::from(root),
            Ok(_) => self.images.fallback_root().to_path_buf(),
            Err(e) => {
                warn!(error = %e, "Image root lookup failed, using configured root");
                self.images.fallback_root().to_path_buf()
            }
        };

        let path = self
            .images
            .store(&root, &device, kind, &payload.file_name, &payload.format, &payload.image)
            .await
            .map_err(|e| NormalizationError::Storage(e.to_string()))?;

        let record = ImageRecord {
            device: device.as_str().to_string(),
            file_name: payload.file_name,
            format: payload.format,
            image: path.to_string_lossy().into_owned(),
        };
        let id = self.store.insert_image(kind, &record).await?;

        let message_kind = match kind {
            ImageKind::Crop => MessageKind::CropImage,
            ImageKind::Full => MessageKind::FullImage,
        };
        Ok(Outcome {
            event: event(message_kind, &device, None, &record)?,
            persisted: PersistedRecord::Image { id, kind, record },
            broadcast: None,
        })
    }
}

fn parse<T: serde::de::DeserializeOwned>(document: Value) -> Result<T, NormalizationError> {
    serde_json::from_value(document).map_err(|e| NormalizationError::Parse(e.to_string()))
}

fn event(
    kind: MessageKind,
    device: &DeviceToken,
    timestamp_ms: Option<i64>,
    record: &impl Serialize,
) -> Result<NormalizedEvent, NormalizationError> {
    let fields = match serde_json::to_value(record) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(e) => return Err(NormalizationError::Persist(e.to_string())),
    };
    Ok(NormalizedEvent {
        kind,
        device: device.clone(),
        occurred_at: timestamp_ms
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now),
        fields,
    })
}

fn recognition(
    direction: Option<String>,
    lp_visible: Option<bool>,
    speedmph: Option<f64>,
    lp: LpData,
    vehicle: VehicleData,
) -> RecognitionColumns {
    let lp_bb = vehicle.lp_bb.unwrap_or_default();
    let vehicle_bb = vehicle.vehicle_bb.unwrap_or_default();
    RecognitionColumns {
        direction,
        lp_visible,
        speedmph,
        lp_country: lp.country,
        lp_country_confidence: lp.country_confidence,
        lp_crop_image: lp.lp_crop_image,
        lp_ocr: lp.lp_ocr,
        lp_ocr_confidence: lp.lp_ocr_confidence,
        lp_plate_category: lp.plate_category,
        lp_plate_category_conf: lp.plate_category_conf,
        vehicle_color: vehicle.color,
        vehicle_color_confidence: vehicle.color_confidence,
        vehicle_lp_bb_conf: lp_bb.bb_conf,
        vehicle_lp_bb_h: lp_bb.h,
        vehicle_lp_bb_w: lp_bb.w,
        vehicle_lp_bb_x: lp_bb.x,
        vehicle_lp_bb_y: lp_bb.y,
        vehicle_make: vehicle.make,
        vehicle_make_confidence: vehicle.make_confidence,
        vehicle_model: vehicle.model,
        vehicle_model_confidence: vehicle.model_confidence,
        vehicle_bb_conf: vehicle_bb.bb_conf,
        vehicle_bb_h: vehicle_bb.h,
        vehicle_bb_w: vehicle_bb.w,
        vehicle_bb_x: vehicle_bb.x,
        vehicle_bb_y: vehicle_bb.y,
        vehicle_image_file_name: vehicle.vehicle_image_file_name,
        vehicle_type: vehicle.vehicle_type,
        vehicle_type_conf: vehicle.vehicle_type_conf,
    }
}

struct Display {
    violation: Option<String>,
    timestamp_ms: Option<i64>,
    speed: Option<f64>,
    direction: Option<String>,
    sitename: Option<String>,
}

fn envelope(
    kind: MessageKind,
    device: &DeviceToken,
    lp: &LpData,
    vehicle: &VehicleData,
    display: Display,
) -> BroadcastEnvelope {
    let event_type = kind.envelope_type().to_string();
    BroadcastEnvelope {
        event_type: event_type.clone(),
        data: EnvelopeData {
            event_type,
            plate_number: lp
                .lp_ocr
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
            violation: display.violation,
            confidence: lp.lp_ocr_confidence.unwrap_or(0.0),
            timestamp: display
                .timestamp_ms
                .and_then(DateTime::from_timestamp_millis)
                .map(iso_millis),
            image_url: vehicle.vehicle_image_file_name.clone(),
            device: device.as_str().to_string(),
            speed: display.speed,
            direction: display.direction,
            sitename: display.sitename,
            make: vehicle.make.clone(),
            model: vehicle.model.clone(),
            color: vehicle.color.clone(),
            vehicle_type: vehicle.vehicle_type.clone(),
        },
    }
}

// --- Worker ---

struct NormalizeRequest {
    kind: String,
    topic: String,
    payload: Bytes,
    responder: oneshot::Sender<NormalizeReply>,
}

#[derive(Default)]
struct Counters {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Success and failure totals observed by the handle's callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NormalizerStats {
    pub succeeded: u64,
    pub failed: u64,
}

/// Caller side of the normalizer worker.
#[derive(Clone)]
pub struct NormalizerHandle {
    tx: mpsc::Sender<NormalizeRequest>,
    counters: Arc<Counters>,
}

impl NormalizerHandle {
    /// Queues one message and waits for its tagged reply.
    pub async fn process(&self, kind: &str, topic: &str, payload: Bytes) -> NormalizeReply {
        let (responder, reply) = oneshot::channel();
        let request = NormalizeRequest {
            kind: kind.to_string(),
            topic: topic.to_string(),
            payload,
            responder,
        };

        let result = if self.tx.send(request).await.is_err() {
            Err(NormalizationError::WorkerFault("normalizer worker is not running".to_string()))
        } else {
            reply.await.unwrap_or_else(|_| {
                Err(NormalizationError::WorkerFault("normalizer dropped the request".to_string()))
            })
        };

        let counter = if result.is_ok() { &self.counters.succeeded } else { &self.counters.failed };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    pub fn stats(&self) -> NormalizerStats {
        NormalizerStats {
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

/// # Spawn Normalizer
///
/// Starts the worker thread. It exits once every [`NormalizerHandle`] clone has
/// been dropped and the queue has drained.
pub fn spawn_normalizer(
    normalizer: Normalizer,
    queue_depth: usize,
) -> std::io::Result<(NormalizerHandle, JoinHandle<()>)> {
    let (tx, mut rx) = mpsc::channel::<NormalizeRequest>(queue_depth.max(1));

    let thread = std::thread::Builder::new()
        .name("normalizer".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(error = %e, "Normalizer runtime failed to start");
                    return;
                }
            };
            runtime.block_on(async move {
                info!("Normalizer worker started");
                while let Some(request) = rx.recv().await {
                    let reply = AssertUnwindSafe(normalizer.process(
                        &request.kind,
                        &request.topic,
                        &request.payload,
                    ))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(NormalizationError::WorkerFault(panic_message(panic))));

                    if request.responder.send(reply).is_err() {
                        debug!(topic = %request.topic, "Normalizer caller went away before the reply");
                    }
                }
                info!("Normalizer worker stopped");
            });
        })?;

    Ok((
        NormalizerHandle {
            tx,
            counters: Arc::new(Counters::default()),
        },
        thread,
    ))
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::records::BrokerSettings;
    use crate::connections::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    /// Delegates to a [`MemoryStore`] but panics on the first ALPR insert.
    struct PanicOnceStore {
        inner: MemoryStore,
        armed: AtomicBool,
    }

    #[async_trait]
    impl TelemetryStore for PanicOnceStore {
        async fn insert_status(&self, record: &StatusRecord) -> Result<i64, StoreError> {
            self.inner.insert_status(record).await
        }

        async fn insert_alpr(&self, record: &AlprRecord) -> Result<i64, StoreError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                panic!("connection state corrupted");
            }
            self.inner.insert_alpr(record).await
        }

        async fn insert_violation(
            &self,
            record: &ViolationRecord,
            case: CaseDraft,
        ) -> Result<LinkedIds, StoreError> {
            self.inner.insert_violation(record, case).await
        }

        async fn insert_image(&self, kind: ImageKind, record: &ImageRecord) -> Result<i64, StoreError> {
            self.inner.insert_image(kind, record).await
        }

        async fn image_root(&self) -> Result<Option<String>, StoreError> {
            self.inner.image_root().await
        }

        async fn broker_settings(&self) -> Result<Option<BrokerSettings>, StoreError> {
            self.inner.broker_settings().await
        }

        async fn select_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>, StoreError> {
            self.inner.select_rows(sql, params).await
        }
    }

    fn normalizer(store: Arc<MemoryStore>, root: &std::path::Path) -> Normalizer {
        let images = ImageStorage::with_date_source(
            root,
            Arc::new(|| NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
        );
        Normalizer::new(store, images, 1)
    }

    fn alpr_payload() -> Value {
        json!({
            "direction": "north",
            "eventId": "e-1",
            "lpVisible": true,
            "sitename": "Main St",
            "speedmph": 42.5,
            "timestampUnixMs": 1_700_000_000_000_i64,
            "lpData": { "lpOcr": "ABC123", "lpOcrConfidence": 0.97, "country": "US" },
            "vehicleData": {
                "make": "Ford", "model": "Focus", "color": "red", "vehicleType": "car",
                "vehicleImageFileName": "veh_1.jpg",
                "lpBb": { "BbConf": 0.8, "h": 1, "w": 2, "x": 3, "y": 4 }
            }
        })
    }

    #[tokio::test]
    async fn alpr_envelope_carries_display_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let n = normalizer(store.clone(), tmp.path());

        let payload = serde_json::to_vec(&alpr_payload()).unwrap();
        let outcome = n.process("alpr", "ns/x/device7/alpr", &payload).await.unwrap();

        let envelope = outcome.broadcast.unwrap();
        assert_eq!(envelope.event_type, "ALPR");
        assert_eq!(envelope.data.plate_number, "ABC123");
        assert_eq!(envelope.data.device, "device7");
        assert_eq!(envelope.data.confidence, 0.97);
        assert_eq!(envelope.data.timestamp.as_deref(), Some("2023-11-14T22:13:20.000Z"));
        assert_eq!(envelope.data.image_url.as_deref(), Some("veh_1.jpg"));

        let rows = store.alprs();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].recognition.lp_ocr.as_deref(), Some("ABC123"));
        assert_eq!(rows[0].recognition.vehicle_lp_bb_x, Some(3.0));
        assert_eq!(outcome.event.fields["lp_country"], "US");
    }

    #[tokio::test]
    async fn loosely_typed_recognition_fields_still_persist_and_broadcast() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let n = normalizer(store.clone(), tmp.path());

        let payload = json!({
            "speedmph": "42",
            "lpVisible": 1,
            "lpData": { "lpOcr": "ABC123", "lpOcrConfidence": "0.9" }
        });
        let outcome = n
            .process("alpr", "ns/x/device7/alpr", &serde_json::to_vec(&payload).unwrap())
            .await
            .unwrap();

        let data = outcome.broadcast.unwrap().data;
        assert_eq!(data.plate_number, "ABC123");
        assert_eq!(data.speed, Some(42.0));
        assert_eq!(data.confidence, 0.9);
        let rows = store.alprs();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].recognition.lp_visible, Some(true));
    }

    #[tokio::test]
    async fn missing_plate_falls_back_to_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let n = normalizer(store, tmp.path());

        let outcome = n.process("alpr", "ns/x/cam/alpr", br#"{"speedmph": 12}"#).await.unwrap();
        let data = outcome.broadcast.unwrap().data;
        assert_eq!(data.plate_number, "Unknown");
        assert_eq!(data.confidence, 0.0);
        assert!(data.timestamp.is_none());
    }

    #[tokio::test]
    async fn malformed_json_is_a_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let n = normalizer(store.clone(), tmp.path());

        for raw in [&b"{not json"[..], b"", b"null", b"[1,2]"] {
            let err = n.process("alpr", "ns/x/cam/alpr", raw).await.unwrap_err();
            assert_eq!(err.stage(), NormalizationStage::Parse, "{:?}", raw);
        }
        assert!(store.alprs().is_empty());
    }

    #[tokio::test]
    async fn status_is_persisted_but_not_broadcast() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let n = normalizer(store.clone(), tmp.path());

        let outcome = n.process("status", "ns/x/cam/status", br#"{"status":"exploded"}"#).await.unwrap();
        assert!(outcome.broadcast.is_none());
        assert_eq!(store.statuses()[0].status, DeviceStatus::Unknown);
    }

    #[tokio::test]
    async fn violation_links_exactly_one_case_to_generated_id() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let n = normalizer(store.clone(), tmp.path());

        let payload = json!({
            "eventId": 77,
            "sitename": "Bridge",
            "timestampUnixMs": 1_700_000_000_000_i64,
            "alprData": { "speedmph": 80, "lpData": { "lpOcr": "XYZ9" } },
            "violationData": { "bb": [10, 20, 30, 40], "type": "speeding" }
        });
        let outcome = n
            .process("violation", "ns/x/cam9/violation", &serde_json::to_vec(&payload).unwrap())
            .await
            .unwrap();

        let PersistedRecord::Violation { ids, record } = &outcome.persisted else {
            panic!("expected a violation record");
        };
        assert_eq!(record.violation_bb_y, Some(40.0));
        assert_eq!(record.event_id.as_deref(), Some("77"));

        let cases = store.cases();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].violation_id, ids.violation_id);
        assert_eq!(cases[0].status, CASE_INITIAL_STATUS);
        assert_eq!(cases[0].user_id, 1);

        let data = outcome.broadcast.unwrap().data;
        assert_eq!(data.violation.as_deref(), Some("speeding"));
        assert_eq!(data.plate_number, "XYZ9");
    }

    #[tokio::test]
    async fn link_failure_is_distinct_from_persist_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let n = normalizer(store.clone(), tmp.path());

        store.fail_case_links(true);
        let err = n.process("violation", "ns/x/cam/violation", b"{}").await.unwrap_err();
        assert_eq!(err.stage(), NormalizationStage::Link);
        assert!(store.violations().is_empty());

        store.fail_case_links(false);
        store.fail_inserts(true);
        let err = n.process("violation", "ns/x/cam/violation", b"{}").await.unwrap_err();
        assert_eq!(err.stage(), NormalizationStage::Persist);
    }

    #[tokio::test]
    async fn images_are_written_then_path_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let configured = tmp.path().join("configured");
        let store = Arc::new(MemoryStore::new());
        store.set_image_root(configured.to_string_lossy());
        let n = normalizer(store.clone(), &tmp.path().join("fallback"));

        let outcome = n
            .process(
                "cropimage",
                "ns/x/cam1/cropimage",
                br#"{"fileName":"p1","format":"jpg","image":"aGVsbG8="}"#,
            )
            .await
            .unwrap();
        assert!(outcome.broadcast.is_none());

        let (kind, record) = store.images().remove(0);
        assert_eq!(kind, ImageKind::Crop);
        let expected = configured.join("cam1/2024-03-01/crop/p1.jpg");
        assert_eq!(record.image, expected.to_string_lossy());
        assert_eq!(std::fs::read(expected).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn image_without_required_fields_fails_to_parse() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let n = normalizer(store, tmp.path());
        let err = n.process("fullimage", "ns/x/cam/fullimage", br#"{"fileName":"a"}"#).await.unwrap_err();
        assert_eq!(err.stage(), NormalizationStage::Parse);
    }

    #[tokio::test]
    async fn unknown_kind_is_reported_not_raised() {
        let tmp = tempfile::tempdir().unwrap();
        let n = normalizer(Arc::new(MemoryStore::new()), tmp.path());
        let err = n.process("telemetry", "ns/x/cam/telemetry", b"{}").await.unwrap_err();
        assert_eq!(err, NormalizationError::UnknownKind("telemetry".into()));
    }

    #[tokio::test]
    async fn worker_replies_in_order_and_survives_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (handle, _thread) = spawn_normalizer(normalizer(store.clone(), tmp.path()), 8).unwrap();

        let bad = handle.process("alpr", "ns/x/cam/alpr", Bytes::from_static(b"{oops")).await;
        assert_eq!(bad.unwrap_err().stage(), NormalizationStage::Parse);

        let good = handle
            .process("alpr", "ns/x/cam/alpr", Bytes::from(serde_json::to_vec(&alpr_payload()).unwrap()))
            .await
            .unwrap();
        assert_eq!(good.broadcast.unwrap().data.plate_number, "ABC123");
        assert_eq!(handle.stats(), NormalizerStats { succeeded: 1, failed: 1 });
    }

    #[tokio::test]
    async fn worker_reports_a_panic_as_a_fault_and_keeps_serving() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(PanicOnceStore {
            inner: MemoryStore::new(),
            armed: AtomicBool::new(true),
        });
        let images = ImageStorage::with_date_source(
            tmp.path(),
            Arc::new(|| NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
        );
        let (handle, _thread) = spawn_normalizer(Normalizer::new(store.clone(), images, 1), 8).unwrap();
        let payload = || Bytes::from(serde_json::to_vec(&alpr_payload()).unwrap());

        let err = handle.process("alpr", "ns/x/cam/alpr", payload()).await.unwrap_err();
        assert_eq!(err.stage(), NormalizationStage::Worker);
        assert!(err.to_string().contains("connection state corrupted"));

        let outcome = handle.process("alpr", "ns/x/cam/alpr", payload()).await.unwrap();
        assert_eq!(outcome.broadcast.unwrap().data.plate_number, "ABC123");
        assert_eq!(store.inner.alprs().len(), 1);
        assert_eq!(handle.stats(), NormalizerStats { succeeded: 1, failed: 1 });
    }
}
