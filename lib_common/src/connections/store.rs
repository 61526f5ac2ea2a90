//! # Telemetry Store
//!
//! The persistence contract shared by the normalizer worker and the query
//! executor. Production uses [`crate::connections::PgTelemetryStore`]; tests and
//! local runs without a database use [`MemoryStore`].

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::connections::records::{
    AlprRecord, BrokerSettings, CaseDraft, CaseRecord, ImageKind, ImageRecord, LinkedIds,
    StatusRecord, ViolationRecord,
};

/// Errors raised by a [`TelemetryStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to reach the store: {0}")]
    Connection(String),
    #[error("Statement failed: {0}")]
    Query(String),
    /// The violation row was written but the case record tracking it was not.
    /// The whole write has been rolled back.
    #[error("Failed to link case record to violation {violation_id}: {message}")]
    Link { violation_id: i64, message: String },
    #[error("Value conversion failed: {0}")]
    Conversion(String),
}

/// # Telemetry Store Contract
///
/// Every insert returns the generated row identifier. `insert_violation` writes
/// the violation and its case record as one unit: the case is built from the
/// identifier read back from the violation insert, and a failure on either side
/// leaves nothing behind.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn insert_status(&self, record: &StatusRecord) -> Result<i64, StoreError>;

    async fn insert_alpr(&self, record: &AlprRecord) -> Result<i64, StoreError>;

    async fn insert_violation(
        &self,
        record: &ViolationRecord,
        case: CaseDraft,
    ) -> Result<LinkedIds, StoreError>;

    async fn insert_image(&self, kind: ImageKind, record: &ImageRecord) -> Result<i64, StoreError>;

    /// The most recently configured image storage root, if any.
    async fn image_root(&self) -> Result<Option<String>, StoreError>;

    /// Broker parameters from the enabled MQTT integration, if one exists.
    async fn broker_settings(&self) -> Result<Option<BrokerSettings>, StoreError>;

    /// Runs a read-only statement written with positional `$n` parameters and
    /// returns each row as a JSON object.
    async fn select_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>, StoreError>;
}

#[derive(Default)]
struct MemoryTables {
    next_id: i64,
    statuses: Vec<(i64, StatusRecord)>,
    alprs: Vec<(i64, AlprRecord)>,
    violations: Vec<(i64, ViolationRecord)>,
    cases: Vec<CaseRecord>,
    images: Vec<(i64, ImageKind, ImageRecord)>,
    image_root: Option<String>,
    broker: Option<BrokerSettings>,
    canned_rows: Option<Vec<Value>>,
    selects: Vec<(String, Vec<Value>)>,
    fail_inserts: bool,
    fail_case_links: bool,
}

impl MemoryTables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_inserts {
            return Err(StoreError::Query("store is rejecting writes".to_string()));
        }
        Ok(())
    }
}

/// # In-Memory Store
///
/// Keeps every table in a `Vec` behind a mutex. Failure switches let tests drive
/// the error paths of the normalizer. When no canned rows are set, `select_rows`
/// echoes the statement and its parameters back as a single row.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MemoryTables) -> R) -> R {
        let mut tables = self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut tables)
    }

    pub fn set_image_root(&self, root: impl Into<String>) {
        self.with(|t| t.image_root = Some(root.into()));
    }

    pub fn set_broker_settings(&self, settings: BrokerSettings) {
        self.with(|t| t.broker = Some(settings));
    }

    pub fn set_select_rows(&self, rows: Vec<Value>) {
        self.with(|t| t.canned_rows = Some(rows));
    }

    /// Makes every insert fail until switched back.
    pub fn fail_inserts(&self, fail: bool) {
        self.with(|t| t.fail_inserts = fail);
    }

    /// Makes the case half of a linked violation write fail.
    pub fn fail_case_links(&self, fail: bool) {
        self.with(|t| t.fail_case_links = fail);
    }

    pub fn statuses(&self) -> Vec<StatusRecord> {
        self.with(|t| t.statuses.iter().map(|(_, r)| r.clone()).collect())
    }

    pub fn alprs(&self) -> Vec<AlprRecord> {
        self.with(|t| t.alprs.iter().map(|(_, r)| r.clone()).collect())
    }

    pub fn violations(&self) -> Vec<(i64, ViolationRecord)> {
        self.with(|t| t.violations.clone())
    }

    pub fn cases(&self) -> Vec<CaseRecord> {
        self.with(|t| t.cases.clone())
    }

    pub fn images(&self) -> Vec<(ImageKind, ImageRecord)> {
        self.with(|t| t.images.iter().map(|(_, k, r)| (*k, r.clone())).collect())
    }

    pub fn executed_selects(&self) -> Vec<(String, Vec<Value>)> {
        self.with(|t| t.selects.clone())
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn insert_status(&self, record: &StatusRecord) -> Result<i64, StoreError> {
        self.with(|t| {
            t.check_writable()?;
            let id = t.allocate_id();
            t.statuses.push((id, record.clone()));
            Ok(id)
        })
    }

    async fn insert_alpr(&self, record: &AlprRecord) -> Result<i64, StoreError> {
        self.with(|t| {
            t.check_writable()?;
            let id = t.allocate_id();
            t.alprs.push((id, record.clone()));
            Ok(id)
        })
    }

    async fn insert_violation(
        &self,
        record: &ViolationRecord,
        case: CaseDraft,
    ) -> Result<LinkedIds, StoreError> {
        self.with(|t| {
            t.check_writable()?;
            let violation_id = t.allocate_id();
            if t.fail_case_links {
                // Nothing was pushed yet, so the "rollback" is just not committing.
                return Err(StoreError::Link {
                    violation_id,
                    message: "case table is rejecting writes".to_string(),
                });
            }
            let case = case.link(violation_id);
            let case_id: Uuid = case.id;
            t.violations.push((violation_id, record.clone()));
            t.cases.push(case);
            Ok(LinkedIds { violation_id, case_id })
        })
    }

    async fn insert_image(&self, kind: ImageKind, record: &ImageRecord) -> Result<i64, StoreError> {
        self.with(|t| {
            t.check_writable()?;
            let id = t.allocate_id();
            t.images.push((id, kind, record.clone()));
            Ok(id)
        })
    }

    async fn image_root(&self) -> Result<Option<String>, StoreError> {
        Ok(self.with(|t| t.image_root.clone()))
    }

    async fn broker_settings(&self) -> Result<Option<BrokerSettings>, StoreError> {
        Ok(self.with(|t| t.broker.clone()))
    }

    async fn select_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>, StoreError> {
        self.with(|t| {
            t.selects.push((sql.to_string(), params.to_vec()));
            Ok(match &t.canned_rows {
                Some(rows) => rows.clone(),
                None => {
                    let mut row = Map::new();
                    row.insert("sql".to_string(), json!(sql));
                    row.insert("params".to_string(), Value::Array(params.to_vec()));
                    vec![Value::Object(row)]
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::records::{DeviceStatus, RecognitionColumns};

    fn violation() -> ViolationRecord {
        ViolationRecord {
            device: "cam-1".into(),
            event_id: Some("ev-9".into()),
            sitename: Some("east".into()),
            timestamp_unix_ms: None,
            recognition: RecognitionColumns::default(),
            violation_bb_h: None,
            violation_bb_w: None,
            violation_bb_x: None,
            violation_bb_y: None,
            violation_c_shot_image_file_name: None,
            violation_type: Some("speeding".into()),
            violation_video_uri: None,
        }
    }

    fn draft() -> CaseDraft {
        CaseDraft {
            violation_time: None,
            sitename: Some("east".into()),
            violation_type: Some("speeding".into()),
            status: "pending".into(),
            assignee: 1,
        }
    }

    #[tokio::test]
    async fn linked_violation_write_references_generated_id() {
        let store = MemoryStore::new();
        store
            .insert_status(&StatusRecord { device: "cam-1".into(), status: DeviceStatus::Normal })
            .await
            .unwrap();
        let ids = store.insert_violation(&violation(), draft()).await.unwrap();

        let cases = store.cases();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].violation_id, ids.violation_id);
        assert_eq!(cases[0].id, ids.case_id);
        assert_eq!(store.violations()[0].0, ids.violation_id);
    }

    #[tokio::test]
    async fn failed_case_link_leaves_no_violation_behind() {
        let store = MemoryStore::new();
        store.fail_case_links(true);
        let err = store.insert_violation(&violation(), draft()).await.unwrap_err();
        assert!(matches!(err, StoreError::Link { .. }));
        assert!(store.violations().is_empty());
        assert!(store.cases().is_empty());
    }

    #[tokio::test]
    async fn select_echoes_parameters_without_canned_rows() {
        let store = MemoryStore::new();
        let rows = store.select_rows("SELECT $1", &[json!(5)]).await.unwrap();
        assert_eq!(rows[0]["params"], json!([5]));

        store.set_select_rows(vec![json!({"id": 1})]);
        let rows = store.select_rows("SELECT 1", &[]).await.unwrap();
        assert_eq!(rows, vec![json!({"id": 1})]);
        assert_eq!(store.executed_selects().len(), 2);
    }
}
