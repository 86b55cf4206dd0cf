//! HTTP exposure of the embedded store.
//!
//! The master process mounts this router so nodes, standby masters and
//! the admin CLI in other processes share its [`MemoryStore`]. Watch
//! events are delivered by long-polling `/store/events`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use super::{CreateMode, MemoryStore, StoreBackend, StoreEvent, WatchKind};
use crate::error::KattaResult;

/// Upper bound for one long-poll, independent of what the client asks for
const MAX_POLL_MS: u64 = 30_000;

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateBody {
    pub session: String,
    pub path: String,
    pub data: String,
    pub mode: CreateMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateResponse {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteBody {
    pub path: String,
    pub data: String,
    pub expected_version: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadResponse {
    pub data: String,
    pub version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WatchBody {
    pub session: String,
    pub path: String,
    pub kind: WatchKind,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PathParams {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventParams {
    pub session: String,
    pub wait_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventsResponse {
    pub events: Vec<StoreEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChildrenResponse {
    pub children: Vec<String>,
}

pub fn create_store_router(store: Arc<MemoryStore>) -> Router {
    Router::new()
        .route("/store/session", post(create_session))
        .route("/store/session/{id}", delete(close_session))
        .route("/store/entry", post(create_entry))
        .route("/store/entry", get(read_entry))
        .route("/store/entry", put(write_entry))
        .route("/store/entry", delete(delete_entry))
        .route("/store/exists", get(entry_exists))
        .route("/store/children", get(entry_children))
        .route("/store/watch", post(register_watch))
        .route("/store/events", get(poll_events))
        .with_state(store)
        .layer(TraceLayer::new_for_http())
}

async fn create_session(
    State(store): State<Arc<MemoryStore>>,
) -> KattaResult<Json<SessionResponse>> {
    let session_id = store.create_session().await?;
    tracing::debug!(session = %session_id, "Store session opened");
    Ok(Json(SessionResponse { session_id }))
}

async fn close_session(
    State(store): State<Arc<MemoryStore>>,
    Path(id): Path<String>,
) -> KattaResult<Json<serde_json::Value>> {
    store.close_session(&id).await?;
    Ok(Json(serde_json::json!({ "closed": true })))
}

async fn create_entry(
    State(store): State<Arc<MemoryStore>>,
    Json(body): Json<CreateBody>,
) -> KattaResult<Json<CreateResponse>> {
    let path = store
        .create(&body.session, &body.path, body.data, body.mode)
        .await?;
    Ok(Json(CreateResponse { path }))
}

async fn read_entry(
    State(store): State<Arc<MemoryStore>>,
    Query(params): Query<PathParams>,
) -> KattaResult<Json<ReadResponse>> {
    let (data, version) = store.read(&params.path).await?;
    Ok(Json(ReadResponse { data, version }))
}

async fn write_entry(
    State(store): State<Arc<MemoryStore>>,
    Json(body): Json<WriteBody>,
) -> KattaResult<Json<WriteResponse>> {
    let version = store
        .write(&body.path, body.data, body.expected_version)
        .await?;
    Ok(Json(WriteResponse { version }))
}

async fn delete_entry(
    State(store): State<Arc<MemoryStore>>,
    Query(params): Query<PathParams>,
) -> KattaResult<Json<serde_json::Value>> {
    if params.recursive {
        store.delete_recursive(&params.path).await?;
    } else {
        store.delete(&params.path).await?;
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn entry_exists(
    State(store): State<Arc<MemoryStore>>,
    Query(params): Query<PathParams>,
) -> KattaResult<Json<ExistsResponse>> {
    let exists = store.exists(&params.path).await?;
    Ok(Json(ExistsResponse { exists }))
}

async fn entry_children(
    State(store): State<Arc<MemoryStore>>,
    Query(params): Query<PathParams>,
) -> KattaResult<Json<ChildrenResponse>> {
    let children = store.children(&params.path).await?;
    Ok(Json(ChildrenResponse { children }))
}

async fn register_watch(
    State(store): State<Arc<MemoryStore>>,
    Json(body): Json<WatchBody>,
) -> KattaResult<Json<serde_json::Value>> {
    store.watch(&body.session, &body.path, body.kind).await?;
    Ok(Json(serde_json::json!({ "watching": true })))
}

async fn poll_events(
    State(store): State<Arc<MemoryStore>>,
    Query(params): Query<EventParams>,
) -> KattaResult<Json<EventsResponse>> {
    let wait = Duration::from_millis(params.wait_ms.min(MAX_POLL_MS));
    let events = store.poll_events(&params.session, wait).await?;
    Ok(Json(EventsResponse { events }))
}
