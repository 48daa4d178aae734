use anyhow::Result;
use clap::{Arg, Command};
use std::path::PathBuf;
use std::sync::Arc;
use stream_server::config::Config;
use stream_server::http::{AppState, HttpServer, WsSettings};
use stream_server::hub::StreamHub;
use stream_server::ingest::{IngestPipeline, IngestServer};
use stream_server::storage::{CaptureStorage, JsonlCaptureStorage, MemoryRecordStore, RecordStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("stream-server")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Telemetry Streaming Team")
        .about("Telemetry collector and live fan-out server")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to TOML configuration file"),
        )
        .arg(
            Arg::new("quic-port")
                .long("quic-port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .help("QUIC ingest port"),
        )
        .arg(
            Arg::new("http-port")
                .long("http-port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .help("HTTP/WebSocket port"),
        )
        .arg(
            Arg::new("node-id")
                .long("node-id")
                .value_name("ID")
                .help("Node identifier used in match ids"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let mut config = Config::load(config_path.as_deref())?;

    if let Some(port) = matches.get_one::<u16>("quic-port") {
        config.quic_port = *port;
    }
    if let Some(port) = matches.get_one::<u16>("http-port") {
        config.http_port = *port;
    }
    if let Some(node_id) = matches.get_one::<String>("node-id") {
        config.node_id = node_id.clone();
    }
    config.validate()?;

    // 初始化日志 - 使用环境变量 RUST_LOG 控制级别
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(false)
        .init();

    info!("Stream server starting...");
    info!("  Node ID: {}", config.node_id);
    info!("  Capture dir: {:?}", config.capture_dir);

    let cancel = CancellationToken::new();

    // 存储
    let capture = Arc::new(JsonlCaptureStorage::new(
        config.capture_dir.clone(),
        config.capture_retention,
        config.capture_max_size,
    )?);
    capture.spawn_cleanup(config.cleanup_interval, cancel.clone());
    let records: Arc<dyn RecordStore> =
        Arc::new(MemoryRecordStore::new(config.record_limit_per_match));
    let capture_dyn: Arc<dyn CaptureStorage> = capture.clone();

    // 分发
    let hub = Arc::new(
        StreamHub::new(config.hub.clone())
            .with_capture(capture_dyn.clone())
            .with_records(records.clone()),
    );
    hub.spawn_maintenance(cancel.clone());
    hub.spawn_stats_logger(cancel.clone());
    info!("Stream hub initialized");

    // QUIC 入站
    let pipeline = IngestPipeline::new(hub.clone(), config.node_id.clone())
        .with_capture(capture_dyn.clone())
        .with_records(records.clone());
    let ingest_server = IngestServer::new(config.quic_addr()?, pipeline)?;

    // HTTP / WebSocket
    let state = AppState {
        hub: hub.clone(),
        capture: Some(capture_dyn),
        records: Some(records),
        access_token: config.access_token.as_deref().map(Arc::from),
        ws: WsSettings {
            ping_interval: config.ws_ping_interval,
            read_timeout: config.ws_read_timeout,
            ..WsSettings::default()
        },
    };
    if state.access_token.is_some() {
        info!("API access token required");
    }
    let http_server = HttpServer::new(config.http_addr()?, state);

    let ingest_cancel = cancel.clone();
    let ingest_handle = tokio::spawn(async move {
        if let Err(e) = ingest_server.run(ingest_cancel).await {
            error!("Ingest server error: {}", e);
        }
    });

    let http_cancel = cancel.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_cancel).await {
            error!("HTTP server error: {}", e);
        }
    });

    info!("Stream server ready, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    cancel.cancel();

    let _ = tokio::join!(ingest_handle, http_handle);
    capture.shutdown().await;

    info!(
        "Stream server stopped, {} frames received",
        hub.frames_received()
    );
    Ok(())
}
