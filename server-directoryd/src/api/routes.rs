use std::collections::BTreeMap;
use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shared::types::{ServerId, ServerRecord, UpdateMode};
use crate::directory::MergeSummary;
use crate::error::DirectoryError;
use crate::filter::{parse, CombinedFilter, QuickFilters};
use crate::launcher::LaunchOutcome;
use crate::manager::{DirectoryManager, DirectoryStatus};
use crate::sort::SortMode;
use crate::view::{ViewRegistry, ViewSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DirectoryManager>,
    pub views: Arc<ViewRegistry>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: DirectoryStatus,
    pub hash: String,
}

#[derive(Deserialize)]
pub struct ServerQuery {
    pub filter: Option<String>,
    pub sort: Option<SortMode>,
}

#[derive(Serialize)]
pub struct ScanResponse {
    pub added: Vec<ServerId>,
    pub removed: Vec<ServerId>,
    pub total: usize,
}

impl From<MergeSummary> for ScanResponse {
    fn from(summary: MergeSummary) -> Self {
        Self {
            added: summary.added,
            removed: summary.removed,
            total: summary.total,
        }
    }
}

#[derive(Deserialize)]
pub struct FavouriteRequest {
    pub favourite: bool,
}

#[derive(Deserialize)]
pub struct CarRequest {
    pub car: Option<String>,
    pub skin: Option<String>,
}

#[derive(Deserialize)]
pub struct BookingRequest {
    pub car: String,
    pub skin: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct JoinRequest {
    pub car: Option<String>,
    pub password: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct AutoJoinRequest {
    #[serde(default)]
    pub any_car: bool,
    pub password: Option<String>,
}

#[derive(Deserialize)]
pub struct ViewUpdate {
    pub filter: Option<String>,
    pub quick_filters: Option<BTreeMap<String, bool>>,
    pub sort: Option<SortMode>,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorBody>)>;

fn reject(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (status, Json(ErrorBody { error: message.into() }))
}

fn directory_error(e: DirectoryError) -> (StatusCode, Json<ErrorBody>) {
    let status = match &e {
        DirectoryError::NotFound(_) => StatusCode::NOT_FOUND,
        DirectoryError::SourceUnavailable(_) | DirectoryError::Probe(_) => StatusCode::BAD_GATEWAY,
        DirectoryError::BookingRejected(_) | DirectoryError::NoCarAvailable(_) | DirectoryError::Cancelled => {
            StatusCode::CONFLICT
        }
        DirectoryError::Closed => {
            tracing::error!("Request hit a stopped directory: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    reject(status, e.to_string())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/status", get(get_status))
        .route("/v1/scan", post(scan))
        .route("/v1/servers", get(get_servers))
        .route("/v1/servers/hash", get(get_hash))
        .route("/v1/servers/:id", get(get_server))
        .route("/v1/servers/:id/refresh", post(refresh_server))
        .route("/v1/servers/:id/favourite", post(set_favourite))
        .route("/v1/servers/:id/car", post(select_car))
        .route("/v1/servers/:id/booking", post(book).delete(cancel_booking))
        .route("/v1/servers/:id/join", post(join))
        .route("/v1/servers/:id/autojoin", get(autojoin_state).post(arm_autojoin).delete(disarm_autojoin))
        .route("/v1/servers/:id/watch", post(watch).delete(unwatch))
        .route("/v1/views/:key", get(get_view).put(update_view).delete(close_view))
        .route("/v1/views/:key/refresh", post(refresh_view))
        .with_state(state)
}

async fn get_status(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    let status = state.manager.status().borrow().clone();
    let hash = state.manager.directory().hash().await.map_err(directory_error)?;
    Ok(Json(StatusResponse { status, hash }))
}

async fn scan(State(state): State<AppState>) -> ApiResult<ScanResponse> {
    state
        .manager
        .scan()
        .await
        .map(|summary| Json(summary.into()))
        .map_err(directory_error)
}

/// Ad-hoc listing. Views are the incremental alternative.
async fn get_servers(
    State(state): State<AppState>,
    Query(params): Query<ServerQuery>,
) -> ApiResult<Vec<ServerRecord>> {
    let first = match params.filter.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
        Some(text) => Some(parse(text).map_err(|e| reject(StatusCode::BAD_REQUEST, e.to_string()))?),
        None => None,
    };
    let filter = CombinedFilter::new(first, None);
    let sort = params.sort.unwrap_or_default();

    let records = state.manager.directory().snapshot().await.map_err(directory_error)?;
    let ctx = state.manager.filter_context();
    let mut records: Vec<ServerRecord> = records.into_iter().filter(|r| filter.test(r, &ctx)).collect();
    records.sort_by(|a, b| sort.compare(a, b));
    Ok(Json(records))
}

async fn get_hash(State(state): State<AppState>) -> Result<String, (StatusCode, Json<ErrorBody>)> {
    state.manager.directory().hash().await.map_err(directory_error)
}

async fn get_server(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ServerRecord> {
    let id = ServerId::from(id);
    state
        .manager
        .directory()
        .get(id.clone())
        .await
        .map_err(directory_error)?
        .map(Json)
        .ok_or_else(|| directory_error(DirectoryError::NotFound(id)))
}

async fn refresh_server(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ServerRecord> {
    state
        .manager
        .update(&ServerId::from(id), UpdateMode::Full)
        .await
        .map(Json)
        .map_err(directory_error)
}

async fn set_favourite(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FavouriteRequest>,
) -> ApiResult<ServerRecord> {
    state
        .manager
        .set_favourite(&ServerId::from(id), body.favourite)
        .await
        .map(Json)
        .map_err(directory_error)
}

async fn select_car(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CarRequest>,
) -> ApiResult<ServerRecord> {
    state
        .manager
        .select_car(&ServerId::from(id), body.car, body.skin)
        .await
        .map(Json)
        .map_err(directory_error)
}

async fn book(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<BookingRequest>,
) -> ApiResult<ServerRecord> {
    state
        .manager
        .book(&ServerId::from(id), body.car, body.skin)
        .await
        .map(Json)
        .map_err(directory_error)
}

async fn cancel_booking(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ServerRecord> {
    state
        .manager
        .cancel_booking(&ServerId::from(id))
        .await
        .map(Json)
        .map_err(directory_error)
}

/// Waits until the game exits.
async fn join(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<JoinRequest>>,
) -> ApiResult<LaunchOutcome> {
    let Json(body) = body.unwrap_or_default();
    state
        .manager
        .join(&ServerId::from(id), body.car, body.password)
        .await
        .map(Json)
        .map_err(directory_error)
}

async fn arm_autojoin(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<AutoJoinRequest>>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let Json(body) = body.unwrap_or_default();
    state
        .manager
        .arm_autojoin(&ServerId::from(id), body.any_car, body.password)
        .await
        .map(|_| StatusCode::ACCEPTED)
        .map_err(directory_error)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AutoJoinState {
    pub armed: bool,
}

async fn autojoin_state(State(state): State<AppState>, Path(id): Path<String>) -> Json<AutoJoinState> {
    Json(AutoJoinState {
        armed: state.manager.autojoin_armed(&ServerId::from(id)).await,
    })
}

async fn disarm_autojoin(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if state.manager.disarm_autojoin(&ServerId::from(id)).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Keep a record fresh while a client shows its details.
async fn watch(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ServerRecord> {
    let id = ServerId::from(id);
    let record = state
        .manager
        .directory()
        .get(id.clone())
        .await
        .map_err(directory_error)?
        .ok_or_else(|| directory_error(DirectoryError::NotFound(id.clone())))?;
    state.manager.watch(&id).await;
    Ok(Json(record))
}

async fn unwatch(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.manager.unwatch(&ServerId::from(id)).await;
    StatusCode::NO_CONTENT
}

async fn get_view(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult<ViewSnapshot> {
    let session = state.views.open(&key).await.map_err(directory_error)?;
    Ok(Json(session.snapshot().await))
}

async fn update_view(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<ViewUpdate>,
) -> ApiResult<ViewSnapshot> {
    let session = state.views.open(&key).await.map_err(directory_error)?;
    if let Some(filter) = body.filter {
        session
            .set_filter(filter)
            .await
            .map_err(|e| reject(StatusCode::BAD_REQUEST, e.to_string()))?;
    }
    if let Some(quick) = body.quick_filters {
        session.set_quick_filters(QuickFilters::from_map(&quick)).await;
    }
    if let Some(sort) = body.sort {
        session.set_sort(sort).await;
    }
    Ok(Json(session.snapshot().await))
}

async fn close_view(State(state): State<AppState>, Path(key): Path<String>) -> StatusCode {
    if state.views.close(&key).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn refresh_view(State(state): State<AppState>, Path(key): Path<String>) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let session = state.views.open(&key).await.map_err(directory_error)?;
    session.refresh().await.map_err(directory_error)?;
    Ok(StatusCode::ACCEPTED)
}
