//! # Pipeline Data Model
//!
//! Types that flow through the ingestion pipeline:
//!
//! - [`MessageKind`] and [`DeviceToken`], both derived from the broker topic.
//! - [`RawMessage`], the unprocessed broker delivery.
//! - The inbound payload shapes, one explicit struct per message kind.
//! - [`NormalizedEvent`], the immutable result of a successful normalization.
//! - [`BroadcastEnvelope`], the reduced projection pushed to dashboard clients.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// The kind of a device message, taken from the last topic segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Status,
    Alpr,
    Violation,
    CropImage,
    FullImage,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Status,
        MessageKind::Alpr,
        MessageKind::Violation,
        MessageKind::CropImage,
        MessageKind::FullImage,
    ];

    /// The topic segment devices publish this kind under.
    pub fn segment(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Alpr => "alpr",
            Self::Violation => "violation",
            Self::CropImage => "cropimage",
            Self::FullImage => "fullimage",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.segment() == segment)
    }

    /// The `type` tag used on the push channel.
    pub fn envelope_type(&self) -> &'static str {
        match self {
            Self::Status => "STATUS",
            Self::Alpr => "ALPR",
            Self::Violation => "VIOLATION",
            Self::CropImage => "CROP_IMAGE",
            Self::FullImage => "FULL_IMAGE",
        }
    }
}

impl Serialize for MessageKind {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.envelope_type())
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

/// Last segment of a topic, the raw kind string handed to the normalizer.
pub fn kind_segment(topic: &str) -> &str {
    topic.rsplit('/').next().unwrap_or_default()
}

/// # Device Token
///
/// The third topic segment (`domain/vendor/<device>/<kind>`). It tags every
/// persisted record and partitions image storage, so it is untrusted input:
/// use [`DeviceToken::path_component`] before it touches the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceToken(String);

impl DeviceToken {
    pub const UNKNOWN: &'static str = "unknown";

    /// Extracts the device segment, falling back to `"unknown"` when the topic
    /// is too short or the segment is empty.
    pub fn from_topic(topic: &str) -> Self {
        match topic.split('/').nth(2) {
            Some(segment) if !segment.is_empty() => Self(segment.to_string()),
            _ => Self(Self::UNKNOWN.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn path_component(&self) -> String {
        sanitize_path_component(&self.0)
    }
}

impl fmt::Display for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reduces an untrusted string to a single safe path segment.
pub fn sanitize_path_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        DeviceToken::UNKNOWN.to_string()
    } else {
        trimmed.to_string()
    }
}

/// A broker delivery before any parsing.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

// --- Inbound payloads ---

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StatusPayload {
    pub status: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LpData {
    pub country: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub country_confidence: Option<f64>,
    pub lp_crop_image: Option<String>,
    #[serde(deserialize_with = "scalar_string")]
    pub lp_ocr: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub lp_ocr_confidence: Option<f64>,
    pub plate_category: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub plate_category_conf: Option<f64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct BoundingBox {
    #[serde(rename = "BbConf", deserialize_with = "lenient_f64")]
    pub bb_conf: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub h: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub w: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub x: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub y: Option<f64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VehicleData {
    pub color: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub color_confidence: Option<f64>,
    pub lp_bb: Option<BoundingBox>,
    pub make: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub make_confidence: Option<f64>,
    pub model: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub model_confidence: Option<f64>,
    #[serde(rename = "vechicleBb")]
    pub vehicle_bb: Option<BoundingBox>,
    pub vehicle_image_file_name: Option<String>,
    pub vehicle_type: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub vehicle_type_conf: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlprPayload {
    pub direction: Option<String>,
    #[serde(deserialize_with = "scalar_string")]
    pub event_id: Option<String>,
    pub full_image_file_name: Option<String>,
    #[serde(deserialize_with = "lenient_bool")]
    pub lp_visible: Option<bool>,
    pub sitename: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub speedmph: Option<f64>,
    #[serde(deserialize_with = "epoch_millis")]
    pub timestamp_unix_ms: Option<i64>,
    pub lp_data: Option<LpData>,
    pub vehicle_data: Option<VehicleData>,
}

/// The recognition block nested inside a violation.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlprData {
    pub direction: Option<String>,
    #[serde(deserialize_with = "lenient_bool")]
    pub lp_visible: Option<bool>,
    #[serde(deserialize_with = "lenient_f64")]
    pub speedmph: Option<f64>,
    pub lp_data: Option<LpData>,
    pub vehicle_data: Option<VehicleData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ViolationData {
    /// `[h, w, x, y]`
    #[serde(deserialize_with = "lenient_f64_list")]
    pub bb: Option<Vec<Option<f64>>>,
    pub c_shot_image_file_name: Option<String>,
    #[serde(rename = "type")]
    pub violation_type: Option<String>,
    #[serde(rename = "violationVideoURI")]
    pub violation_video_uri: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ViolationPayload {
    #[serde(deserialize_with = "scalar_string")]
    pub event_id: Option<String>,
    pub sitename: Option<String>,
    #[serde(deserialize_with = "epoch_millis")]
    pub timestamp_unix_ms: Option<i64>,
    pub alpr_data: Option<AlprData>,
    pub violation_data: Option<ViolationData>,
}

/// Crop and full image captures share one shape; all fields are required.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePayload {
    pub file_name: String,
    pub format: String,
    pub image: String,
}

/// Accepts a string or a number and keeps its textual form.
fn scalar_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// Devices are inconsistent about quoting numbers and flags. A value of the
/// wrong shape reads as absent instead of failing the whole message.
fn number_like(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(Option::<Value>::deserialize(d)?.as_ref().and_then(number_like))
}

fn lenient_f64_list<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<Option<f64>>>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Array(items)) => Some(items.iter().map(number_like).collect()),
        _ => None,
    })
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Bool(b)) => Some(b),
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

/// Accepts integer, float or numeric-string epoch milliseconds.
fn epoch_millis<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    })
}

// --- Outbound ---

/// # Normalized Event
///
/// Produced exactly once per message that parses and persists. `fields` holds
/// the flattened record as written to the store. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub kind: MessageKind,
    pub device: DeviceToken,
    pub occurred_at: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

/// Display fields sent to dashboards for ALPR and violation events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeData {
    pub event_type: String,
    pub plate_number: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub violation: Option<String>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub image_url: Option<String>,
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub direction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sitename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub make: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub vehicle_type: Option<String>,
}

/// The wire frame `{ "type": ..., "data": {...} }` broadcast to push clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EnvelopeData,
}

/// ISO-8601 UTC with millisecond precision, e.g. `2024-03-01T10:00:00.000Z`.
pub fn iso_millis(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn device_token_comes_from_third_segment() {
        assert_eq!(DeviceToken::from_topic("ns/x/device7/alpr").as_str(), "device7");
        assert_eq!(DeviceToken::from_topic("ns/x").as_str(), "unknown");
        assert_eq!(DeviceToken::from_topic("ns/x//alpr").as_str(), "unknown");
    }

    #[test]
    fn hostile_device_tokens_cannot_escape_storage_root() {
        assert_eq!(sanitize_path_component(".."), "unknown");
        assert_eq!(sanitize_path_component("../etc"), "_etc");
        assert_eq!(sanitize_path_component("cam 1\\x"), "cam_1_x");
        assert_eq!(sanitize_path_component("cam-01.a"), "cam-01.a");
    }

    #[test]
    fn kind_is_the_last_topic_segment() {
        assert_eq!(kind_segment("hazen/v/dev/cropimage"), "cropimage");
        assert_eq!(MessageKind::from_segment("cropimage"), Some(MessageKind::CropImage));
        assert_eq!(MessageKind::from_segment("telemetry"), None);
    }

    #[test]
    fn lenient_scalars_in_alpr_payload() {
        let payload: AlprPayload = serde_json::from_value(json!({
            "eventId": 1234,
            "timestampUnixMs": "1700000000000",
            "vehicleData": { "vechicleBb": { "BbConf": 0.9, "h": 12 } }
        }))
        .unwrap();
        assert_eq!(payload.event_id.as_deref(), Some("1234"));
        assert_eq!(payload.timestamp_unix_ms, Some(1_700_000_000_000));
        let bb = payload.vehicle_data.unwrap().vehicle_bb.unwrap();
        assert_eq!(bb.bb_conf, Some(0.9));
        assert_eq!(bb.h, Some(12.0));
    }

    #[test]
    fn quoted_numbers_and_numeric_flags_are_coerced() {
        let payload: AlprPayload = serde_json::from_value(json!({
            "speedmph": "42",
            "lpVisible": 1,
            "lpData": { "lpOcr": 7771, "lpOcrConfidence": "0.9", "countryConfidence": {} },
            "vehicleData": { "lpBb": { "x": "3", "y": null }, "makeConfidence": "high" }
        }))
        .unwrap();
        assert_eq!(payload.speedmph, Some(42.0));
        assert_eq!(payload.lp_visible, Some(true));
        let lp = payload.lp_data.unwrap();
        assert_eq!(lp.lp_ocr.as_deref(), Some("7771"));
        assert_eq!(lp.lp_ocr_confidence, Some(0.9));
        assert_eq!(lp.country_confidence, None);
        let vehicle = payload.vehicle_data.unwrap();
        assert_eq!(vehicle.make_confidence, None);
        let lp_bb = vehicle.lp_bb.unwrap();
        assert_eq!((lp_bb.x, lp_bb.y), (Some(3.0), None));

        let violation: ViolationPayload = serde_json::from_value(json!({
            "alprData": { "lpVisible": "false", "speedmph": 80 },
            "violationData": { "bb": ["1", 2, "x", null] }
        }))
        .unwrap();
        let alpr = violation.alpr_data.unwrap();
        assert_eq!((alpr.lp_visible, alpr.speedmph), (Some(false), Some(80.0)));
        assert_eq!(
            violation.violation_data.unwrap().bb,
            Some(vec![Some(1.0), Some(2.0), None, None])
        );
    }

    #[test]
    fn envelope_omits_absent_display_fields() {
        let envelope = BroadcastEnvelope {
            event_type: "ALPR".into(),
            data: EnvelopeData {
                event_type: "ALPR".into(),
                plate_number: "Unknown".into(),
                violation: None,
                confidence: 0.0,
                timestamp: None,
                image_url: None,
                device: "cam".into(),
                speed: Some(31.5),
                direction: None,
                sitename: None,
                make: None,
                model: None,
                color: None,
                vehicle_type: None,
            },
        };
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            wire,
            json!({"type": "ALPR", "data": {
                "eventType": "ALPR", "plateNumber": "Unknown", "confidence": 0.0,
                "device": "cam", "speed": 31.5
            }})
        );
    }

    #[test]
    fn iso_timestamps_use_millisecond_z_form() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(iso_millis(at), "2023-11-14T22:13:20.123Z");
    }
}
