//! Report search over recognition and violation history.
//!
//! The handler only builds a named-placeholder query from the request filters
//! and hands it to the `executeQuery` task, so the search runs on the query
//! executor thread and never on the ingestion path.

use crate::ingest_logic::state::{AppError, AppState};
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use lib_common::pipeline::EXECUTE_QUERY;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

pub const DEFAULT_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportSource {
    Alpr,
    Violation,
    #[default]
    All,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSearch {
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub plate_number: Option<String>,
    pub min_speed: Option<f64>,
    pub location: Option<String>,
    pub vehicle_type: Option<String>,
    #[serde(default)]
    pub source: ReportSource,
    pub limit: Option<i64>,
}

/// A search ready for the `executeQuery` task.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportQuery {
    pub query: String,
    pub params: Vec<Value>,
}

impl ReportQuery {
    pub fn task_params(&self) -> Value {
        json!({ "query": self.query, "queryParams": self.params })
    }
}

const ALPR_COLUMNS: &str = r#"'ALPR' AS "eventType", "id", "device", "sitename", "timestampUnixMs",
    "lp_lpOcr" AS "plateNumber", "lp_lpOcrConfidence" AS "confidence", "speedmph" AS "speed",
    "direction", "vehicle_make" AS "make", "vehicle_model" AS "model", "vehicle_color" AS "color",
    "vehicle_vehicleType" AS "vehicleType", NULL::text AS "violation", "createdAt""#;

const VIOLATION_COLUMNS: &str = r#"'VIOLATION' AS "eventType", "id", "device", "sitename", "timestampUnixMs",
    "lp_lpOcr" AS "plateNumber", "lp_lpOcrConfidence" AS "confidence", "speedmph" AS "speed",
    "direction", "vehicle_make" AS "make", "vehicle_model" AS "model", "vehicle_color" AS "color",
    "vehicle_vehicleType" AS "vehicleType", "violation_type" AS "violation", "createdAt""#;

impl ReportSearch {
    /// Placeholders appear in the same order as `params`; both branches of
    /// the union reuse the same names.
    pub fn to_query(&self) -> ReportQuery {
        let mut filters = Vec::new();
        let mut params = Vec::new();

        if let Some(from) = non_empty(&self.from_date) {
            filters.push(r#""createdAt" >= :fromDate"#);
            params.push(json!(from));
        }
        if let Some(to) = non_empty(&self.to_date) {
            filters.push(r#""createdAt" < :toDate"#);
            params.push(json!(to));
        }
        if let Some(plate) = non_empty(&self.plate_number) {
            filters.push(r#""lp_lpOcr" ILIKE '%' || :plateNumber || '%'"#);
            params.push(json!(plate));
        }
        if let Some(speed) = self.min_speed {
            filters.push(r#""speedmph" >= :minSpeed"#);
            params.push(json!(speed));
        }
        if let Some(location) = non_empty(&self.location) {
            filters.push(r#""sitename" = :location"#);
            params.push(json!(location));
        }
        if let Some(vehicle_type) = non_empty(&self.vehicle_type) {
            filters.push(r#""vehicle_vehicleType" = :vehicleType"#);
            params.push(json!(vehicle_type));
        }

        let where_clause = if filters.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", filters.join(" AND "))
        };
        let alpr = format!(r#"SELECT {} FROM "HazenAlpr"{}"#, ALPR_COLUMNS, where_clause);
        let violation = format!(r#"SELECT {} FROM "HazenViolation"{}"#, VIOLATION_COLUMNS, where_clause);
        let body = match self.source {
            ReportSource::Alpr => alpr,
            ReportSource::Violation => violation,
            ReportSource::All => format!("{} UNION ALL {}", alpr, violation),
        };

        params.push(json!(self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)));
        ReportQuery {
            query: format!(r#"{} ORDER BY "createdAt" DESC LIMIT :limit"#, body),
            params,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub async fn search_reports(
    State(state): State<AppState>,
    body: Result<Json<ReportSearch>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(search) = body?;
    let report = search.to_query();
    debug!(params = ?report.params, "Report search");
    let rows = state.dispatcher.run_task(EXECUTE_QUERY, report.task_params()).await?;
    Ok(Json(rows))
}
