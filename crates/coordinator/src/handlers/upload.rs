use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use std::sync::Arc;

use crate::handlers::authorize_bearer;
use crate::ledger;
use crate::models::{new_hex_id, UploadChunkQuery, UploadInitRequest};
use crate::swarm::SwarmCommand;
use crate::AppState;

pub async fn upload_init(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<UploadInitRequest>,
) -> impl IntoResponse {
    let caller = match authorize_bearer(&headers, &state) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    if payload.user_id != caller {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "Unauthorized" })),
        )
            .into_response();
    }

    let file_id = new_hex_id();
    match ledger::create_file(
        &state.db,
        &file_id,
        payload.user_id,
        &payload.filename,
        payload.file_size,
        payload.total_chunks,
    )
    .await
    {
        Ok(()) => {
            tracing::info!("upload initialized: {} ({})", payload.filename, file_id);
            (StatusCode::OK, Json(serde_json::json!({ "fileId": file_id }))).into_response()
        }
        Err(e) => {
            tracing::error!("upload init db error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Db error" })),
            )
                .into_response()
        }
    }
}

/// Raw chunk upload. Inserts the ledger row, stages the bytes in the
/// overflow cache so a fully failed fan-out can still be retried by the
/// reconciler, and hands the swarm hub a best-effort distribution command.
/// The uploader is never blocked on peer confirmations.
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadChunkQuery>,
    body: Bytes,
) -> impl IntoResponse {
    if body.is_empty() {
        tracing::warn!("empty chunk upload attempt");
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "No data" })),
        )
            .into_response();
    }

    let chunk_id = new_hex_id();
    match ledger::insert_chunk(
        &state.db,
        &chunk_id,
        &query.file_id,
        query.chunk_index,
        &query.chunk_hash,
    )
    .await
    {
        Ok(true) => {}
        Ok(false) => {
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": "Chunk index already uploaded" })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("chunk insert error: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Db error" })),
            )
                .into_response();
        }
    }

    if let Err(e) = state.cache.put(&chunk_id, &body).await {
        tracing::error!("failed to stage chunk {} in cache: {}", chunk_id, e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "Db error" })),
        )
            .into_response();
    }
    if let Err(e) = ledger::mark_placed(&state.db, &chunk_id, Utc::now().timestamp()).await {
        tracing::error!("failed to stamp placement for chunk {}: {}", chunk_id, e);
    }

    let _ = state.hub_tx.try_send(SwarmCommand::Distribute {
        chunk_id: chunk_id.clone(),
        bytes: body,
    });

    tracing::debug!("chunk uploaded: {} (index {})", chunk_id, query.chunk_index);
    (
        StatusCode::OK,
        Json(serde_json::json!({ "chunkId": chunk_id, "status": "distributing" })),
    )
        .into_response()
}
