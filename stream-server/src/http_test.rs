#[cfg(test)]
mod tests {
    use crate::http::{create_router, AppState};
    use crate::hub::{HubConfig, StreamHub};
    use crate::storage::{CaptureStorage, JsonlCaptureStorage, MemoryRecordStore, RecordStore};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use chrono::Utc;
    use common::{Frame, MatchId};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn state() -> AppState {
        AppState::new(Arc::new(StreamHub::new(HubConfig::default())))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
        request(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
    }

    async fn request(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get(create_router(state()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert!(body["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn test_list_and_info() {
        let state = state();
        let id = MatchId::new(Uuid::new_v4(), "node-a").unwrap();
        state
            .hub
            .broadcast_frame(&id, Frame::new(1, Utc::now(), json!({})));

        let (status, body) = get(create_router(state.clone()), "/api/v3/stream").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["streams"][0]["match_id"], id.to_string());
        assert_eq!(body["streams"][0]["frames"], 1);

        let uri = format!("/api/v3/stream/{}/info", id);
        let (status, body) = get(create_router(state.clone()), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "live");

        let unknown = MatchId::new(Uuid::new_v4(), "node-a").unwrap();
        let uri = format!("/api/v3/stream/{}/info", unknown);
        let (status, body) = get(create_router(state.clone()), &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());

        let (status, _) = get(create_router(state), "/api/v3/stream/not-a-match/info").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_info_for_completed_capture() {
        let dir = tempfile::tempdir().unwrap();
        let capture = Arc::new(
            JsonlCaptureStorage::new(dir.path(), Duration::from_secs(3600), u64::MAX).unwrap(),
        );
        let id = MatchId::new(Uuid::new_v4(), "node-a").unwrap();
        capture
            .write_frame(&id, &Frame::new(1, Utc::now(), json!({})))
            .await
            .unwrap();
        capture.finish(&id).await.unwrap();

        let mut state = state();
        state.capture = Some(capture);

        let uri = format!("/api/v3/stream/{}/info", id);
        let (status, body) = get(create_router(state), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert!(body["file"].as_str().unwrap().ends_with(".jsonl"));
    }

    #[tokio::test]
    async fn test_match_frames_pagination() {
        let records = Arc::new(MemoryRecordStore::new(100));
        let id = MatchId::new(Uuid::new_v4(), "node-a").unwrap();
        for index in 1..=5 {
            records
                .store(&id, &Frame::new(index, Utc::now(), json!({})))
                .await
                .unwrap();
        }

        let mut state = state();
        state.records = Some(records);

        let uri = format!("/api/v3/matches/{}/frames?limit=2&offset=1", id);
        let (status, body) = get(create_router(state), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 5);
        assert_eq!(body["limit"], 2);
        let frames = body["frames"].as_array().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["frame_index"], 2);
    }

    #[tokio::test]
    async fn test_access_token_gate() {
        let mut state = state();
        state.access_token = Some(Arc::from("secret"));

        let (status, _) = get(create_router(state.clone()), "/api/v3/stream").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = get(create_router(state.clone()), "/api/v3/stream?token=wrong").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = get(create_router(state.clone()), "/api/v3/stream?token=secret").await;
        assert_eq!(status, StatusCode::OK);

        let authorized = Request::builder()
            .uri("/api/v3/stream")
            .header(header::AUTHORIZATION, "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = request(create_router(state.clone()), authorized).await;
        assert_eq!(status, StatusCode::OK);

        // 健康检查不需要令牌
        let (status, _) = get(create_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_access_token_with_reserved_characters() {
        let mut state = state();
        state.access_token = Some(Arc::from("s3cr+t/=&"));

        let uri = "/api/v3/stream?token=s3cr%2Bt%2F%3D%26";
        let (status, _) = get(create_router(state.clone()), uri).await;
        assert_eq!(status, StatusCode::OK);

        // 未编码的 `+` 解码为空格
        let (status, _) = get(create_router(state), "/api/v3/stream?token=s3cr+t/=").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
