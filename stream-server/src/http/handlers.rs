use super::AppState;
use crate::error::{Result, StreamError};
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use common::MatchId;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

const DEFAULT_PAGE_LIMIT: usize = 100;
const MAX_PAGE_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct FramesQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// 健康检查
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

/// 当前所有比赛流
pub async fn list_streams(State(state): State<AppState>) -> Json<Value> {
    let streams = state.hub.list_streams();
    Json(json!({ "streams": streams }))
}

/// 单场比赛概况：内存中有流时返回实时信息，否则查找已完成的采集文件
pub async fn stream_info(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
) -> Result<Response> {
    let match_id: MatchId = match_id.parse()?;

    if let Some(info) = state.hub.stream_info(&match_id) {
        return Ok(Json(info).into_response());
    }

    if let Some(capture) = &state.capture {
        if capture.is_complete(&match_id).await {
            if let Ok(path) = capture.get_file(&match_id).await {
                return Ok(Json(json!({
                    "match_id": match_id,
                    "status": "completed",
                    "file": path.display().to_string(),
                }))
                .into_response());
            }
        }
    }

    Err(StreamError::StreamNotFound(match_id.to_string()))
}

/// 分页查询历史帧
pub async fn match_frames(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    Query(query): Query<FramesQuery>,
) -> Result<Json<Value>> {
    let match_id: MatchId = match_id.parse()?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let Some(records) = &state.records else {
        return Err(StreamError::StreamNotFound(match_id.to_string()));
    };

    let (frames, total) = records.query_paginated(&match_id, limit, offset).await?;
    debug!(
        "Frames query for {}: {} of {} (offset {})",
        match_id,
        frames.len(),
        total,
        offset
    );

    Ok(Json(json!({
        "match_id": match_id,
        "frames": frames,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}
