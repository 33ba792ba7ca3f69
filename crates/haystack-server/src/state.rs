//! Request and response bodies of the HTTP API

use chrono::{DateTime, Utc};
use haystack::{Dict, Grid, Num, Ref};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::AppError;

/// Haystack JSON grid: `{"meta": {...}, "cols": [...], "rows": [...]}`
#[derive(Serialize, ToSchema)]
#[schema(value_type = Object)]
#[serde(transparent)]
pub struct GridJson(pub Grid);

/// Haystack JSON dict of tags
#[derive(Serialize, ToSchema)]
#[schema(value_type = Object)]
#[serde(transparent)]
pub struct DictJson(pub Dict);

/// Parse record ids, accepting an optional leading `@`
pub(crate) fn parse_refs(ids: &[String]) -> Result<Vec<Ref>, AppError> {
    ids.iter()
        .map(|id| Ref::new(id).map_err(AppError::from))
        .collect()
}

// ============ Requests ============

#[derive(Deserialize, ToSchema)]
pub struct ReadRequest {
    /// Record ids, e.g. `["@ahu1", "ahu1.dat"]`
    pub ids: Vec<String>,
    /// Fail on the first unknown id instead of returning an empty row
    #[serde(default)]
    pub checked: bool,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WatchSubRequest {
    /// Existing watch to add records to
    pub watch_id: Option<String>,
    /// Display name for a new watch, used when `watchId` is absent
    pub watch_dis: Option<String>,
    /// Lease for a new watch, e.g. `"n:5min"`
    #[schema(value_type = Option<String>)]
    pub lease: Option<Num>,
    pub ids: Vec<String>,
    #[serde(default)]
    pub checked: bool,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WatchUnsubRequest {
    pub watch_id: String,
    #[serde(default)]
    pub ids: Vec<String>,
    /// Close the watch instead of removing ids
    #[serde(default)]
    pub close: bool,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WatchPollRequest {
    pub watch_id: String,
    /// Return every subscribed record rather than only changes
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Deserialize, ToSchema)]
pub struct HisReadRequest {
    pub id: String,
    /// Inclusive start, RFC 3339
    #[schema(value_type = String)]
    pub start: DateTime<Utc>,
    /// Exclusive end, RFC 3339
    #[schema(value_type = String)]
    pub end: DateTime<Utc>,
}

#[derive(Deserialize, ToSchema)]
pub struct HisWriteItem {
    #[schema(value_type = String)]
    pub ts: DateTime<Utc>,
    /// Haystack JSON value
    #[schema(value_type = Object)]
    pub val: serde_json::Value,
}

#[derive(Deserialize, ToSchema)]
pub struct HisWriteRequest {
    pub id: String,
    pub items: Vec<HisWriteItem>,
}

#[derive(Deserialize, ToSchema)]
pub struct PointWriteRequest {
    pub id: String,
    /// Priority level, 1 (highest) to 17
    pub level: u8,
    #[serde(default)]
    pub who: String,
    /// Haystack JSON value; absent or null releases the level
    #[schema(value_type = Option<Object>)]
    pub val: Option<serde_json::Value>,
    /// How long the write holds, e.g. `"n:30s"`
    #[schema(value_type = Option<String>)]
    pub duration: Option<Num>,
}

#[derive(Deserialize, ToSchema)]
pub struct PointWriteArrayRequest {
    pub id: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InvokeActionRequest {
    pub id: String,
    pub action: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub args: Dict,
    pub mime_type: Option<String>,
}

/// Records to insert or replace; each needs an `id` tag
#[derive(Deserialize, ToSchema)]
pub struct CommitRequest {
    #[schema(value_type = Vec<Object>)]
    pub records: Vec<Dict>,
}

// ============ Responses ============

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

#[derive(Serialize, ToSchema)]
pub struct CommitResponse {
    /// Version assigned to each committed record, in request order
    pub versions: Vec<u64>,
}

#[derive(Serialize, ToSchema)]
pub struct WatchInfo {
    /// Absent until the first subscription
    pub id: Option<String>,
    pub dis: String,
    pub lease: Option<String>,
    pub subscribed: usize,
}

#[derive(Serialize, ToSchema)]
pub struct WatchesResponse {
    pub watches: Vec<WatchInfo>,
}

#[derive(Serialize, ToSchema)]
pub struct OkResponse {
    pub ok: bool,
}
