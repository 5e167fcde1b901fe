use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use crate::handlers::authorize_bearer;
use crate::ledger;
use crate::models::{ChunkDescriptor, FileRecord};
use crate::notify::gigabytes;
use crate::AppState;

/// Ordered chunk descriptors for a file the caller owns; the client fetches
/// the actual bytes over the swarm transport.
pub async fn download_manifest(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let caller = match authorize_bearer(&headers, &state) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };

    let owner: Option<i64> = match sqlx::query_scalar("SELECT user_id FROM files WHERE id = ?")
        .bind(&file_id)
        .fetch_optional(&state.db)
        .await
    {
        Ok(owner) => owner,
        Err(e) => {
            tracing::error!("download fetch error: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Db error" })),
            )
                .into_response();
        }
    };
    if owner != Some(caller) {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "Unauthorized" })),
        )
            .into_response();
    }

    let rows: Vec<(String, i64, String)> = match sqlx::query_as(
        "SELECT id, chunk_index, chunk_hash FROM chunks WHERE file_id = ? ORDER BY chunk_index",
    )
    .bind(&file_id)
    .fetch_all(&state.db)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!("download fetch error: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Db error" })),
            )
                .into_response();
        }
    };

    tracing::info!("download requested for file {}", file_id);
    let chunks: Vec<ChunkDescriptor> = rows
        .into_iter()
        .map(|(chunk_id, chunk_index, chunk_hash)| ChunkDescriptor {
            chunk_id,
            chunk_index,
            chunk_hash,
        })
        .collect();
    (StatusCode::OK, Json(serde_json::json!({ "chunks": chunks }))).into_response()
}

pub async fn list_user_files(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let caller = match authorize_bearer(&headers, &state) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    if user_id != caller {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "Unauthorized" })),
        )
            .into_response();
    }

    match sqlx::query_as::<_, FileRecord>(
        "SELECT * FROM files WHERE user_id = ? ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(&state.db)
    .await
    {
        Ok(files) => (StatusCode::OK, Json(serde_json::json!({ "files": files }))).into_response(),
        Err(e) => {
            tracing::error!("file list fetch error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Db error" })),
            )
                .into_response()
        }
    }
}

/// Delete a file: cascades replica records, cached bytes and chunk rows,
/// then fires the negative quota adjustment.
pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let caller = match authorize_bearer(&headers, &state) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };

    let owner: Option<i64> = match sqlx::query_scalar("SELECT user_id FROM files WHERE id = ?")
        .bind(&file_id)
        .fetch_optional(&state.db)
        .await
    {
        Ok(owner) => owner,
        Err(e) => {
            tracing::error!("delete db error: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Db error" })),
            )
                .into_response();
        }
    };
    match owner {
        None => {
            tracing::warn!("delete failed: file {} not found", file_id);
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "File not found" })),
            )
                .into_response();
        }
        Some(owner) if owner != caller => {
            return (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({ "error": "Unauthorized" })),
            )
                .into_response();
        }
        Some(_) => {}
    }

    match ledger::delete_file(&state.db, &file_id).await {
        Ok(Some(deletion)) => {
            state.cache.forget_hot(&deletion.chunk_ids).await;
            let notifier = state.notifier.clone();
            tokio::spawn(async move {
                notifier
                    .update_storage(deletion.user_id, -gigabytes(deletion.file_size_bytes))
                    .await;
            });
            tracing::info!("file deleted: {}", file_id);
            (StatusCode::OK, Json(serde_json::json!({ "success": true }))).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "File not found" })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("delete db error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Db error" })),
            )
                .into_response()
        }
    }
}

/// Bulk deletion of every file a user owns.
pub async fn delete_user_files(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let caller = match authorize_bearer(&headers, &state) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    if user_id != caller {
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "Unauthorized" })),
        )
            .into_response();
    }

    match ledger::delete_user_files(&state.db, user_id).await {
        Ok(deletion) => {
            state.cache.forget_hot(&deletion.chunk_ids).await;
            if deletion.file_size_bytes > 0 {
                let notifier = state.notifier.clone();
                let total = deletion.file_size_bytes;
                tokio::spawn(async move {
                    notifier.update_storage(user_id, -gigabytes(total)).await;
                });
            }
            tracing::warn!("all files deleted for user {}", user_id);
            (StatusCode::OK, Json(serde_json::json!({ "success": true }))).into_response()
        }
        Err(e) => {
            tracing::error!("bulk delete db error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Db error" })),
            )
                .into_response()
        }
    }
}
