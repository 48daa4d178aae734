//! 生产端弹性帧链路
//!
//! `FrameLink` 负责把帧可靠地送达采集端：
//!
//! - 有界出站队列，`send` 永不阻塞，队列满时丢弃该帧
//! - 断线后指数退避重连
//! - 断线时长不超过阈值时帧保存在内存，超过后溢出到磁盘
//! - 重连后先重发内存中的帧，再排空磁盘队列，最后恢复实时转发
//!
//! 每条链路有三个后台任务：读任务（每个连接一个）、分发任务和重连任务，
//! 它们通过同一把锁共享连接状态，通过取消令牌统一退出。

mod backoff;
mod dispatch;
mod spill;

pub use backoff::Backoff;
pub use spill::{SpillQueue, SpillReader};

use crate::error::{LinkError, Result};
use crate::transport::{Connector, LinkConnection, MessageSink, MessageStream};
use common::serde_helpers::duration_ms;
use common::{BufferMode, ConnectionState, Frame, IngestAck};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) type SharedSink = Arc<tokio::sync::Mutex<Box<dyn MessageSink>>>;

/// 链路配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    #[serde(with = "duration_ms")]
    pub initial_reconnect_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_reconnect_delay: Duration,
    pub reconnect_multiplier: f64,
    /// 出站队列容量，同时也是断线期间内存缓冲的上限
    pub queue_capacity: usize,
    /// 断线超过该时长后切换到磁盘缓冲
    #[serde(with = "duration_ms")]
    pub disk_buffer_threshold: Duration,
    pub catch_up_batch_size: usize,
    #[serde(with = "duration_ms")]
    pub catch_up_batch_interval: Duration,
    #[serde(with = "duration_ms")]
    pub ping_interval: Duration,
    #[serde(with = "duration_ms")]
    pub write_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub dial_timeout: Duration,
    pub spill_dir: PathBuf,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            reconnect_multiplier: 2.0,
            queue_capacity: 1000,
            disk_buffer_threshold: Duration::from_secs(3),
            catch_up_batch_size: 100,
            catch_up_batch_interval: Duration::from_millis(10),
            ping_interval: Duration::from_secs(50),
            write_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
            spill_dir: std::env::temp_dir(),
        }
    }
}

/// 链路统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub frames_spilled: u64,
    pub reconnects: u64,
}

#[derive(Default)]
struct StatCounters {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    frames_spilled: AtomicU64,
    reconnects: AtomicU64,
}

/// 受锁保护的连接状态
struct ConnectionSlot {
    sink: Option<SharedSink>,
    generation: u64,
    connected: bool,
    disconnected_at: Option<Instant>,
}

pub(crate) struct LinkShared {
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    slot: Mutex<ConnectionSlot>,
    state_tx: watch::Sender<ConnectionState>,
    buffer_mode: Mutex<BufferMode>,
    reconnect_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
    closed: AtomicBool,
    stats: StatCounters,
}

impl LinkShared {
    pub(crate) fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 当前连接的写半部及其代号
    pub(crate) fn current_sink(&self) -> Option<(u64, SharedSink)> {
        let slot = self.slot.lock();
        match (&slot.sink, slot.connected) {
            (Some(sink), true) => Some((slot.generation, sink.clone())),
            _ => None,
        }
    }

    pub(crate) fn disconnected_for(&self) -> Option<Duration> {
        let slot = self.slot.lock();
        if slot.connected {
            return None;
        }
        slot.disconnected_at.map(|at| at.elapsed())
    }

    pub(crate) fn buffer_mode(&self) -> BufferMode {
        *self.buffer_mode.lock()
    }

    pub(crate) fn set_buffer_mode(&self, mode: BufferMode) {
        *self.buffer_mode.lock() = mode;
    }

    pub(crate) fn record_sent(&self) {
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_spilled(&self) {
        self.stats.frames_spilled.fetch_add(1, Ordering::Relaxed);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn trigger_reconnect(&self) {
        // 容量为1：已有待处理的重连请求时直接忽略
        let _ = self.reconnect_tx.try_send(());
    }

    /// 带超时拨号
    async fn dial(&self) -> Result<LinkConnection> {
        match tokio::time::timeout(self.config.dial_timeout, self.connector.connect()).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout),
        }
    }

    /// 安装新连接并启动其读任务
    fn install(self: &Arc<Self>, connection: LinkConnection) {
        let LinkConnection { sink, stream } = connection;

        let generation = {
            let mut slot = self.slot.lock();
            if slot.connected {
                // 已经有活动连接，丢弃新连接
                drop(slot);
                let mut sink = sink;
                tokio::spawn(async move { sink.close().await });
                return;
            }
            slot.generation += 1;
            slot.sink = Some(Arc::new(tokio::sync::Mutex::new(sink)));
            slot.connected = true;
            slot.disconnected_at = None;
            slot.generation
        };

        self.set_state(ConnectionState::Connected);

        let shared = self.clone();
        tokio::spawn(async move { shared.read_loop(generation, stream).await });
    }

    /// 标记指定代号的连接已断开并请求重连；代号已过期时不做任何事
    pub(crate) fn mark_disconnected(&self, generation: u64) -> bool {
        let sink = {
            let mut slot = self.slot.lock();
            if slot.generation != generation || !slot.connected {
                return false;
            }
            slot.connected = false;
            slot.disconnected_at = Some(Instant::now());
            slot.sink.take()
        };

        self.set_state(ConnectionState::Disconnected);

        if let Some(sink) = sink {
            tokio::spawn(async move { sink.lock().await.close().await });
        }

        if !self.closed.load(Ordering::SeqCst) {
            self.trigger_reconnect();
        }
        true
    }

    async fn read_loop(self: Arc<Self>, generation: u64, mut stream: Box<dyn MessageStream>) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = stream.next_line() => next,
            };

            match next {
                Some(Ok(line)) => {
                    // 采集端的确认消息，只关心失败
                    if let Ok(ack) = serde_json::from_str::<IngestAck>(&line) {
                        if !ack.success {
                            error!(
                                "Collector returned error: {}",
                                ack.error.unwrap_or_default()
                            );
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!("Link read error, triggering reconnect: {}", e);
                    self.mark_disconnected(generation);
                    break;
                }
                None => {
                    info!("Link closed by collector");
                    self.mark_disconnected(generation);
                    break;
                }
            }
        }

        debug!("Read loop stopped (generation {})", generation);
    }

    async fn reconnect_loop(self: Arc<Self>, mut reconnect_rx: mpsc::Receiver<()>) {
        let mut backoff = Backoff::new(
            self.config.initial_reconnect_delay,
            self.config.max_reconnect_delay,
            self.config.reconnect_multiplier,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                signal = reconnect_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
            }

            loop {
                if self.current_sink().is_some() {
                    break;
                }

                let delay = backoff.delay();
                info!("Attempting to reconnect in {:?}", delay);

                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                self.set_state(ConnectionState::Connecting);
                match self.dial().await {
                    Ok(connection) => {
                        if self.closed.load(Ordering::SeqCst) {
                            let mut sink = connection.sink;
                            sink.close().await;
                            return;
                        }
                        self.install(connection);
                        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                        backoff.reset();
                        info!("Successfully reconnected to collector");
                        break;
                    }
                    Err(e) => {
                        self.set_state(ConnectionState::Disconnected);
                        let next = backoff.on_failure();
                        warn!("Reconnection failed: {} (next retry in {:?})", e, next);
                    }
                }
            }
        }

        debug!("Reconnect loop stopped");
    }
}

/// 生产端弹性帧链路
pub struct FrameLink {
    shared: Arc<LinkShared>,
    outbound_tx: mpsc::Sender<Frame>,
    pending: Mutex<Option<PendingTasks>>,
    state_rx: watch::Receiver<ConnectionState>,
}

/// 首次连接成功前尚未启动的后台任务所需的资源
struct PendingTasks {
    outbound_rx: mpsc::Receiver<Frame>,
    reconnect_rx: mpsc::Receiver<()>,
}

impl FrameLink {
    pub fn new(connector: Arc<dyn Connector>, config: LinkConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let shared = Arc::new(LinkShared {
            config,
            connector,
            slot: Mutex::new(ConnectionSlot {
                sink: None,
                generation: 0,
                connected: false,
                disconnected_at: None,
            }),
            state_tx,
            buffer_mode: Mutex::new(BufferMode::Memory),
            reconnect_tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            stats: StatCounters::default(),
        });

        Self {
            shared,
            outbound_tx,
            pending: Mutex::new(Some(PendingTasks {
                outbound_rx,
                reconnect_rx,
            })),
            state_rx,
        }
    }

    /// 建立连接；已连接时直接返回。首次成功后启动后台任务。
    pub async fn connect(&self) -> Result<()> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        if self.shared.current_sink().is_some() {
            return Ok(());
        }

        self.shared.set_state(ConnectionState::Connecting);
        let connection = match self.shared.dial().await {
            Ok(connection) => connection,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        self.shared.install(connection);
        self.start_tasks();
        Ok(())
    }

    fn start_tasks(&self) {
        let Some(tasks) = self.pending.lock().take() else {
            return;
        };

        debug!("Link connection established, starting background tasks");

        let dispatcher = dispatch::Dispatcher::new(
            self.shared.clone(),
            tasks.outbound_rx,
            self.state_rx.clone(),
        );
        tokio::spawn(dispatcher.run());

        let shared = self.shared.clone();
        tokio::spawn(shared.reconnect_loop(tasks.reconnect_rx));
    }

    /// 非阻塞入队
    pub fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }

        match self.outbound_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(frame)) => {
                self.shared.record_dropped();
                warn!(
                    "Outgoing queue full, dropping frame {}",
                    frame.frame_index
                );
                Err(LinkError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(LinkError::Closed),
        }
    }

    /// 关闭链路：取消所有后台任务并关闭底层连接。
    /// 溢出文件由分发任务在退出时删除。
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.cancel.cancel();

        let sink = {
            let mut slot = self.shared.slot.lock();
            slot.connected = false;
            slot.sink.take()
        };
        self.shared.set_state(ConnectionState::Disconnected);

        if let Some(sink) = sink {
            let mut sink = sink.lock().await;
            sink.close().await;
        }

        info!("Frame link closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// 订阅连接状态变化
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn buffer_mode(&self) -> BufferMode {
        self.shared.buffer_mode()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> LinkStats {
        let stats = &self.shared.stats;
        LinkStats {
            frames_sent: stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: stats.frames_dropped.load(Ordering::Relaxed),
            frames_spilled: stats.frames_spilled.load(Ordering::Relaxed),
            reconnects: stats.reconnects.load(Ordering::Relaxed),
        }
    }
}

impl Drop for FrameLink {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.cancel.cancel();
    }
}
