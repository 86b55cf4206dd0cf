//! Search RPC endpoint served by every worker node.
//!
//! Three operations, all with compact binary bodies: `doc-freqs`,
//! `search`, `details`. A JSON status route reports the open shards and
//! cache counters.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::search::SearchService;
use crate::error::KattaResult;
use crate::protocol::query::{from_wire, to_wire};
use crate::protocol::{DetailsRequest, DocFreqsRequest, SearchRequest};

pub fn create_node_router(service: Arc<SearchService>) -> Router {
    Router::new()
        .route("/rpc/doc-freqs", post(doc_freqs))
        .route("/rpc/search", post(search))
        .route("/rpc/details", post(get_details))
        .route("/status", get(status))
        .with_state(service)
        .layer(TraceLayer::new_for_http())
}

async fn doc_freqs(
    State(service): State<Arc<SearchService>>,
    body: Bytes,
) -> KattaResult<Vec<u8>> {
    let request: DocFreqsRequest = from_wire(&body)?;
    let response = service.doc_freqs(request).await?;
    to_wire(&response)
}

async fn search(State(service): State<Arc<SearchService>>, body: Bytes) -> KattaResult<Vec<u8>> {
    let request: SearchRequest = from_wire(&body)?;
    let response = service.search(request).await?;
    to_wire(&response)
}

async fn get_details(
    State(service): State<Arc<SearchService>>,
    body: Bytes,
) -> KattaResult<Vec<u8>> {
    let request: DetailsRequest = from_wire(&body)?;
    let response = service.get_details(request).await?;
    to_wire(&response)
}

async fn status(State(service): State<Arc<SearchService>>) -> Json<serde_json::Value> {
    let stats = service.stats();
    Json(serde_json::json!({
        "shards": service.open_shards(),
        "filter_cache_hits": stats.filter_cache_hits,
        "filter_cache_misses": stats.filter_cache_misses,
    }))
}
