//! # Persisted Record Shapes
//!
//! Row types written by the normalizer. Field names serialize to the exact
//! column names of the telemetry tables, so a record can be handed to the store
//! as a JSON object and mapped column-for-column.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Health state reported by a device heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum DeviceStatus {
    #[default]
    Unknown,
    Warmup,
    Normal,
    Fault,
    ConnectionLost,
    DeviceUp,
}

impl DeviceStatus {
    /// Maps a reported status string; anything unrecognised (or missing) is `Unknown`.
    pub fn from_reported(value: Option<&str>) -> Self {
        match value {
            Some("warmup") => Self::Warmup,
            Some("normal") => Self::Normal,
            Some("fault") => Self::Fault,
            Some("connectionLost") => Self::ConnectionLost,
            Some("deviceUp") => Self::DeviceUp,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Warmup => "warmup",
            Self::Normal => "normal",
            Self::Fault => "fault",
            Self::ConnectionLost => "connectionLost",
            Self::DeviceUp => "deviceUp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub device: String,
    pub status: DeviceStatus,
}

/// # Recognition Columns
///
/// The flattened plate-recognition and vehicle-classification columns shared by
/// the ALPR and violation tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecognitionColumns {
    pub direction: Option<String>,
    #[serde(rename = "lpVisible")]
    pub lp_visible: Option<bool>,
    pub speedmph: Option<f64>,

    pub lp_country: Option<String>,
    #[serde(rename = "lp_countryConfidence")]
    pub lp_country_confidence: Option<f64>,
    #[serde(rename = "lp_lpCropImage")]
    pub lp_crop_image: Option<String>,
    #[serde(rename = "lp_lpOcr")]
    pub lp_ocr: Option<String>,
    #[serde(rename = "lp_lpOcrConfidence")]
    pub lp_ocr_confidence: Option<f64>,
    #[serde(rename = "lp_plateCategory")]
    pub lp_plate_category: Option<String>,
    #[serde(rename = "lp_plateCategoryConf")]
    pub lp_plate_category_conf: Option<f64>,

    pub vehicle_color: Option<String>,
    #[serde(rename = "vehicle_colorConfidence")]
    pub vehicle_color_confidence: Option<f64>,
    #[serde(rename = "vehicle_lpBb_BbConf")]
    pub vehicle_lp_bb_conf: Option<f64>,
    #[serde(rename = "vehicle_lpBb_h")]
    pub vehicle_lp_bb_h: Option<f64>,
    #[serde(rename = "vehicle_lpBb_w")]
    pub vehicle_lp_bb_w: Option<f64>,
    #[serde(rename = "vehicle_lpBb_x")]
    pub vehicle_lp_bb_x: Option<f64>,
    #[serde(rename = "vehicle_lpBb_y")]
    pub vehicle_lp_bb_y: Option<f64>,
    pub vehicle_make: Option<String>,
    #[serde(rename = "vehicle_makeConfidence")]
    pub vehicle_make_confidence: Option<f64>,
    pub vehicle_model: Option<String>,
    #[serde(rename = "vehicle_modelConfidence")]
    pub vehicle_model_confidence: Option<f64>,
    // "vechicleBb" is the spelling devices publish, kept in the column names.
    #[serde(rename = "vehicle_vechicleBb_BbConf")]
    pub vehicle_bb_conf: Option<f64>,
    #[serde(rename = "vehicle_vechicleBb_h")]
    pub vehicle_bb_h: Option<f64>,
    #[serde(rename = "vehicle_vechicleBb_w")]
    pub vehicle_bb_w: Option<f64>,
    #[serde(rename = "vehicle_vechicleBb_x")]
    pub vehicle_bb_x: Option<f64>,
    #[serde(rename = "vehicle_vechicleBb_y")]
    pub vehicle_bb_y: Option<f64>,
    #[serde(rename = "vehicle_vehicleImageFileName")]
    pub vehicle_image_file_name: Option<String>,
    #[serde(rename = "vehicle_vehicleType")]
    pub vehicle_type: Option<String>,
    #[serde(rename = "vehicle_vehicleTypeConf")]
    pub vehicle_type_conf: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlprRecord {
    pub device: String,
    #[serde(rename = "eventId")]
    pub event_id: Option<String>,
    #[serde(rename = "fullImageFileName")]
    pub full_image_file_name: Option<String>,
    pub sitename: Option<String>,
    #[serde(rename = "timestampUnixMs")]
    pub timestamp_unix_ms: Option<i64>,
    #[serde(flatten)]
    pub recognition: RecognitionColumns,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub device: String,
    #[serde(rename = "eventId")]
    pub event_id: Option<String>,
    pub sitename: Option<String>,
    #[serde(rename = "timestampUnixMs")]
    pub timestamp_unix_ms: Option<i64>,
    #[serde(flatten)]
    pub recognition: RecognitionColumns,
    #[serde(rename = "violation_Bb_h")]
    pub violation_bb_h: Option<f64>,
    #[serde(rename = "violation_Bb_w")]
    pub violation_bb_w: Option<f64>,
    #[serde(rename = "violation_Bb_x")]
    pub violation_bb_x: Option<f64>,
    #[serde(rename = "violation_Bb_y")]
    pub violation_bb_y: Option<f64>,
    #[serde(rename = "violation_cShotImageFileName")]
    pub violation_c_shot_image_file_name: Option<String>,
    pub violation_type: Option<String>,
    #[serde(rename = "violation_violationVideoURI")]
    pub violation_video_uri: Option<String>,
}

/// Which image table a capture belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Crop,
    Full,
}

impl ImageKind {
    pub fn table(&self) -> &'static str {
        match self {
            Self::Crop => "HazenCropImage",
            Self::Full => "HazenFullImage",
        }
    }
}

/// An image capture. `image` holds the storage path, never the bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub device: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
    pub format: String,
    pub image: String,
}

/// # Case Draft
///
/// Everything the case-tracking record needs except the identifier of the
/// violation it tracks. The store turns it into a [`CaseRecord`] once the
/// violation row exists and its generated id has been read back.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseDraft {
    pub violation_time: Option<DateTime<Utc>>,
    pub sitename: Option<String>,
    pub violation_type: Option<String>,
    pub status: String,
    pub assignee: i64,
}

impl CaseDraft {
    pub fn link(self, violation_id: i64) -> CaseRecord {
        CaseRecord {
            id: Uuid::new_v4(),
            violation_id,
            violation_time: self.violation_time,
            sitename: self.sitename,
            violation_type: self.violation_type,
            status: self.status,
            notification: 0,
            user_id: self.assignee,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub id: Uuid,
    #[serde(rename = "violationId")]
    pub violation_id: i64,
    #[serde(rename = "violationTime")]
    pub violation_time: Option<DateTime<Utc>>,
    pub sitename: Option<String>,
    #[serde(rename = "violationType")]
    pub violation_type: Option<String>,
    pub status: String,
    pub notification: i32,
    #[serde(rename = "userId")]
    pub user_id: i64,
}

/// Identifiers produced by the linked violation write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkedIds {
    pub violation_id: i64,
    pub case_id: Uuid,
}

/// Broker connection parameters stored in the enabled `MQTT` integration row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSettings {
    #[serde(rename = "Brocker URL")]
    pub url: String,
    #[serde(rename = "user", default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}
