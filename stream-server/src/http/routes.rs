use super::{auth, handlers, websocket, AppState};
use axum::{middleware, routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // 实时流
        .route("/api/v3/stream", get(handlers::list_streams))
        .route("/api/v3/stream/:match_id", get(websocket::stream_websocket))
        .route("/api/v3/stream/:match_id/info", get(handlers::stream_info))
        // 历史帧
        .route(
            "/api/v3/matches/:match_id/frames",
            get(handlers::match_frames),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ));

    Router::new()
        .merge(api)
        // 健康检查
        .route("/health", get(handlers::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        // CORS中间件
        .layer(CorsLayer::permissive())
}
