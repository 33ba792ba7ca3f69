//! HTTP REST handlers

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use haystack::{HisItem, HisRange, Ref, Val};
use log::{debug, info, warn};

use crate::core::ServerCore;
use crate::error::AppError;
use crate::state::{
    CommitRequest, CommitResponse, DictJson, ErrorResponse, GridJson, HisReadRequest,
    HisWriteRequest, InvokeActionRequest, OkResponse, PointWriteArrayRequest, PointWriteRequest,
    ReadRequest, WatchInfo, WatchPollRequest, WatchSubRequest, WatchUnsubRequest, WatchesResponse,
    parse_refs,
};

fn logged<T>(op: &str, start: Instant, result: Result<T, AppError>) -> Result<T, AppError> {
    match &result {
        Ok(_) => debug!("{} succeeded in {:.2?}", op, start.elapsed()),
        Err(e) => warn!("{} failed in {:.2?}: {}", op, start.elapsed(), e),
    }
    result
}

/// Server metadata
#[utoipa::path(
    get,
    path = "/about",
    responses((status = 200, description = "About dict", body = DictJson))
)]
pub async fn about(State(core): State<Arc<ServerCore>>) -> Json<DictJson> {
    info!("GET /about");
    Json(DictJson(core.about()))
}

/// Supported operations
#[utoipa::path(
    get,
    path = "/ops",
    responses(
        (status = 200, description = "Grid of ops", body = GridJson),
        (status = 501, description = "Not provided by backend", body = ErrorResponse)
    )
)]
pub async fn ops(State(core): State<Arc<ServerCore>>) -> Result<Json<GridJson>, AppError> {
    info!("GET /ops");
    Ok(Json(GridJson(core.ops()?)))
}

/// Supported data formats
#[utoipa::path(
    get,
    path = "/formats",
    responses(
        (status = 200, description = "Grid of MIME types", body = GridJson),
        (status = 501, description = "Not provided by backend", body = ErrorResponse)
    )
)]
pub async fn formats(State(core): State<Arc<ServerCore>>) -> Result<Json<GridJson>, AppError> {
    info!("GET /formats");
    Ok(Json(GridJson(core.formats()?)))
}

/// Read records by id
#[utoipa::path(
    post,
    path = "/read",
    request_body = ReadRequest,
    responses(
        (status = 200, description = "One row per requested id", body = GridJson),
        (status = 404, description = "Unknown record (checked)", body = ErrorResponse)
    )
)]
pub async fn read(
    State(core): State<Arc<ServerCore>>,
    Json(req): Json<ReadRequest>,
) -> Result<Json<GridJson>, AppError> {
    let start = Instant::now();
    info!("POST /read: {} ids", req.ids.len());
    let ids = parse_refs(&req.ids)?;
    let grid = logged("read", start, core.read(ids, req.checked).await)?;
    Ok(Json(GridJson(grid)))
}

/// Subscribe records to a watch, opening one when `watchDis` is given
#[utoipa::path(
    post,
    path = "/watchSub",
    request_body = WatchSubRequest,
    responses(
        (status = 200, description = "Current state of the records, meta has watchId and lease", body = GridJson),
        (status = 400, description = "Invalid lease or closed watch", body = ErrorResponse),
        (status = 404, description = "Unknown watch or record", body = ErrorResponse)
    )
)]
pub async fn watch_sub(
    State(core): State<Arc<ServerCore>>,
    Json(req): Json<WatchSubRequest>,
) -> Result<Json<GridJson>, AppError> {
    let start = Instant::now();
    info!(
        "POST /watchSub: watch {:?} / '{}', {} ids",
        req.watch_id,
        req.watch_dis.as_deref().unwrap_or(""),
        req.ids.len()
    );
    let ids = parse_refs(&req.ids)?;
    let result = core
        .watch_sub(req.watch_id, req.watch_dis, req.lease, ids, req.checked)
        .await;
    Ok(Json(GridJson(logged("watchSub", start, result)?)))
}

/// Remove records from a watch, or close it
#[utoipa::path(
    post,
    path = "/watchUnsub",
    request_body = WatchUnsubRequest,
    responses(
        (status = 200, description = "Done", body = OkResponse),
        (status = 404, description = "Unknown watch", body = ErrorResponse)
    )
)]
pub async fn watch_unsub(
    State(core): State<Arc<ServerCore>>,
    Json(req): Json<WatchUnsubRequest>,
) -> Result<Json<OkResponse>, AppError> {
    let start = Instant::now();
    info!("POST /watchUnsub: {} close={}", req.watch_id, req.close);
    let ids = parse_refs(&req.ids)?;
    let result = core.watch_unsub(req.watch_id, ids, req.close).await;
    logged("watchUnsub", start, result)?;
    Ok(Json(OkResponse { ok: true }))
}

/// Poll a watch for changes
#[utoipa::path(
    post,
    path = "/watchPoll",
    request_body = WatchPollRequest,
    responses(
        (status = 200, description = "Changed records, or all with refresh", body = GridJson),
        (status = 404, description = "Unknown watch", body = ErrorResponse)
    )
)]
pub async fn watch_poll(
    State(core): State<Arc<ServerCore>>,
    Json(req): Json<WatchPollRequest>,
) -> Result<Json<GridJson>, AppError> {
    let start = Instant::now();
    info!("POST /watchPoll: {} refresh={}", req.watch_id, req.refresh);
    let result = core.watch_poll(req.watch_id, req.refresh).await;
    Ok(Json(GridJson(logged("watchPoll", start, result)?)))
}

/// List open watches
#[utoipa::path(
    get,
    path = "/watches",
    responses((status = 200, description = "Open watches", body = WatchesResponse))
)]
pub async fn watches(State(core): State<Arc<ServerCore>>) -> Json<WatchesResponse> {
    info!("GET /watches");
    let watches = core
        .watches()
        .into_iter()
        .map(|w| WatchInfo {
            id: w.id(),
            dis: w.dis().to_string(),
            lease: w.lease().map(|l| l.to_string()),
            subscribed: w.subscribed().len(),
        })
        .collect();
    Json(WatchesResponse { watches })
}

/// Read history samples in `[start, end)`
#[utoipa::path(
    post,
    path = "/hisRead",
    request_body = HisReadRequest,
    responses(
        (status = 200, description = "Grid of ts/val rows", body = GridJson),
        (status = 404, description = "Unknown point", body = ErrorResponse)
    )
)]
pub async fn his_read(
    State(core): State<Arc<ServerCore>>,
    Json(req): Json<HisReadRequest>,
) -> Result<Json<GridJson>, AppError> {
    let start = Instant::now();
    info!("POST /hisRead: {} [{}, {})", req.id, req.start, req.end);
    let id = Ref::new(&req.id)?;
    let range = HisRange::new(req.start, req.end)?;
    let result = core.his_read(id, range).await;
    Ok(Json(GridJson(logged("hisRead", start, result)?)))
}

/// Write history samples
#[utoipa::path(
    post,
    path = "/hisWrite",
    request_body = HisWriteRequest,
    responses(
        (status = 200, description = "Done", body = OkResponse),
        (status = 404, description = "Unknown point", body = ErrorResponse)
    )
)]
pub async fn his_write(
    State(core): State<Arc<ServerCore>>,
    Json(req): Json<HisWriteRequest>,
) -> Result<Json<OkResponse>, AppError> {
    let start = Instant::now();
    info!("POST /hisWrite: {} ({} items)", req.id, req.items.len());
    let id = Ref::new(&req.id)?;
    let items = req
        .items
        .into_iter()
        .map(|item| match Val::from_json(&item.val)? {
            Some(val) => Ok(HisItem { ts: item.ts, val }),
            None => Err(AppError::BadRequest(format!("null value at {}", item.ts))),
        })
        .collect::<Result<Vec<_>, AppError>>()?;
    logged("hisWrite", start, core.his_write(id, items).await)?;
    Ok(Json(OkResponse { ok: true }))
}

/// Set or release one level of a writable point
#[utoipa::path(
    post,
    path = "/pointWrite",
    request_body = PointWriteRequest,
    responses(
        (status = 200, description = "Write array after the change", body = GridJson),
        (status = 400, description = "Bad level or duration", body = ErrorResponse),
        (status = 404, description = "Unknown point", body = ErrorResponse)
    )
)]
pub async fn point_write(
    State(core): State<Arc<ServerCore>>,
    Json(req): Json<PointWriteRequest>,
) -> Result<Json<GridJson>, AppError> {
    let start = Instant::now();
    info!("POST /pointWrite: {} level {}", req.id, req.level);
    let id = Ref::new(&req.id)?;
    let val = match &req.val {
        Some(json) => Val::from_json(json)?,
        None => None,
    };
    let result = core
        .point_write(id, req.level, req.who, val, req.duration)
        .await;
    Ok(Json(GridJson(logged("pointWrite", start, result)?)))
}

/// Current write array of a point
#[utoipa::path(
    post,
    path = "/pointWriteArray",
    request_body = PointWriteArrayRequest,
    responses(
        (status = 200, description = "17 priority levels", body = GridJson),
        (status = 404, description = "Unknown point", body = ErrorResponse)
    )
)]
pub async fn point_write_array(
    State(core): State<Arc<ServerCore>>,
    Json(req): Json<PointWriteArrayRequest>,
) -> Result<Json<GridJson>, AppError> {
    info!("POST /pointWriteArray: {}", req.id);
    let id = Ref::new(&req.id)?;
    Ok(Json(GridJson(core.point_write_array(id).await?)))
}

/// Invoke a named action on a record
#[utoipa::path(
    post,
    path = "/invokeAction",
    request_body = InvokeActionRequest,
    responses(
        (status = 200, description = "Action result", body = GridJson),
        (status = 501, description = "Not provided by backend", body = ErrorResponse)
    )
)]
pub async fn invoke_action(
    State(core): State<Arc<ServerCore>>,
    Json(req): Json<InvokeActionRequest>,
) -> Result<Json<GridJson>, AppError> {
    let start = Instant::now();
    info!("POST /invokeAction: {} '{}'", req.id, req.action);
    let id = Ref::new(&req.id)?;
    let result = core
        .invoke_action(id, req.action, req.args, req.mime_type)
        .await;
    Ok(Json(GridJson(logged("invokeAction", start, result)?)))
}

/// Insert or replace records
#[utoipa::path(
    post,
    path = "/commit",
    request_body = CommitRequest,
    responses(
        (status = 200, description = "Assigned versions", body = CommitResponse),
        (status = 400, description = "Record without id", body = ErrorResponse)
    )
)]
pub async fn commit(
    State(core): State<Arc<ServerCore>>,
    Json(req): Json<CommitRequest>,
) -> Result<Json<CommitResponse>, AppError> {
    let start = Instant::now();
    info!("POST /commit: {} records", req.records.len());
    let versions = logged("commit", start, core.commit(req.records).await)?;
    Ok(Json(CommitResponse { versions }))
}
