use anyhow::Result;
use clap::{Arg, Command};
use frame_agent::config::Config;
use frame_agent::link::Backoff;
use frame_agent::simulator::FrameSimulator;
use frame_agent::transport::QuicConnector;
use frame_agent::{FrameLink, LinkError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("frame-agent")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Telemetry Streaming Team")
        .about("Telemetry frame producer with resilient delivery")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to TOML configuration file"),
        )
        .arg(
            Arg::new("collector")
                .long("collector")
                .value_name("HOST:PORT")
                .help("Collector address, overrides configuration"),
        )
        .arg(
            Arg::new("frequency")
                .short('f')
                .long("frequency")
                .value_name("FPS")
                .value_parser(clap::value_parser!(u32))
                .help("Frames per second"),
        )
        .arg(
            Arg::new("session")
                .short('s')
                .long("session")
                .value_name("UUID")
                .value_parser(clap::value_parser!(Uuid))
                .help("Match session id"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let mut config = Config::load(config_path.as_deref())?;

    if let Some(collector) = matches.get_one::<String>("collector") {
        let (host, port) = collector
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("Invalid collector address: {}", collector))?;
        config.collector_host = host.to_string();
        config.collector_port = port.parse()?;
    }
    if let Some(frequency) = matches.get_one::<u32>("frequency") {
        config.frequency = *frequency;
    }
    if let Some(session) = matches.get_one::<Uuid>("session") {
        config.session_id = Some(*session);
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

    info!("Frame agent starting...");

    let session_id = config.session_id.unwrap_or_else(Uuid::new_v4);
    let collector_addr = config.collector_addr()?;
    info!("  Collector: {}", collector_addr);
    info!("  Session ID: {}", session_id);
    info!("  Frequency: {} fps", config.frequency);

    let connector = QuicConnector::new(collector_addr, config.server_name.clone())?;
    let link = Arc::new(FrameLink::new(Arc::new(connector), config.link.clone()));

    // 初始连接失败时按退避策略重试
    let mut backoff = Backoff::new(
        config.link.initial_reconnect_delay,
        config.link.max_reconnect_delay,
        config.link.reconnect_multiplier,
    );
    loop {
        match link.connect().await {
            Ok(()) => {
                info!("Connected to collector");
                break;
            }
            Err(e) => {
                let delay = backoff.delay();
                warn!("Initial connection failed: {} (retrying in {:?})", e, delay);
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted before connecting");
                        link.close().await;
                        return Ok(());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                backoff.on_failure();
            }
        }
    }

    let cancel = CancellationToken::new();
    let mut frames = FrameSimulator::new(session_id, config.frequency).start(cancel.clone());
    let mut stats_interval = tokio::time::interval(Duration::from_secs(10));

    info!("Frame agent ready, press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            _ = stats_interval.tick() => {
                let stats = link.stats();
                info!(
                    "Link stats: state={:?} mode={:?} sent={} dropped={} spilled={} reconnects={}",
                    link.state(),
                    link.buffer_mode(),
                    stats.frames_sent,
                    stats.frames_dropped,
                    stats.frames_spilled,
                    stats.reconnects
                );
            }
            frame = frames.recv() => match frame {
                Some(frame) => match link.send(frame) {
                    Ok(()) | Err(LinkError::QueueFull) => {}
                    Err(e) => {
                        error!("Failed to submit frame: {}", e);
                        break;
                    }
                },
                None => break,
            },
        }
    }

    cancel.cancel();
    link.close().await;
    info!("Frame agent stopped");

    Ok(())
}
