mod auth;
mod handlers;
mod routes;
mod websocket;

pub use routes::create_router;
pub use websocket::{receive_pump, send_pump};

use crate::error::Result;
use crate::hub::StreamHub;
use crate::storage::{CaptureStorage, RecordStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 订阅连接的保活参数
#[derive(Debug, Clone, Copy)]
pub struct WsSettings {
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(54),
            read_timeout: Duration::from_secs(60),
            max_message_size: 64 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<StreamHub>,
    pub capture: Option<Arc<dyn CaptureStorage>>,
    pub records: Option<Arc<dyn RecordStore>>,
    pub access_token: Option<Arc<str>>,
    pub ws: WsSettings,
}

impl AppState {
    pub fn new(hub: Arc<StreamHub>) -> Self {
        Self {
            hub,
            capture: None,
            records: None,
            access_token: None,
            ws: WsSettings::default(),
        }
    }
}

pub struct HttpServer {
    addr: SocketAddr,
    state: AppState,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("HTTP server running on {}", self.addr);

        let app = create_router(self.state.clone());
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}
