//! Read-only listing of recorded requests, paged by etag so clients can
//! poll incrementally.

use axum::Json;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::publish::StoreEntry;

#[derive(Debug, Deserialize)]
pub struct EntriesQuery {
    /// Return only entries mutated after this etag
    #[serde(default)]
    pub etag: i64,
}

#[derive(Debug, Serialize)]
pub struct EntriesResponse {
    pub entries: Vec<StoreEntry>,
    pub etag: i64,
}

/// GET /api/requests?etag=N
pub async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<EntriesQuery>,
) -> Json<EntriesResponse> {
    let (entries, etag) = state.publisher.entries(query.etag).await;
    Json(EntriesResponse { entries, etag })
}
