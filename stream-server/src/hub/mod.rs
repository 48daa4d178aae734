//! 采集端多路分发
//!
//! `StreamHub` 是所有比赛流的注册表，也是入站帧广播和订阅者注册的入口。
//! 注册表（`DashMap`）只在查找/插入比赛流时加锁，逐帧操作只锁对应的比赛流。

mod match_stream;
mod replay;
mod ring;
mod session;

pub use match_stream::{MatchStream, StreamInfo};
pub use ring::{FrameRing, RingEntry};
pub use session::{SubscriberSession, Subscription};

use crate::storage::{CaptureStorage, RecordStore};
use common::serde_helpers::duration_ms;
use common::{
    parse_seek_time, ClientMessage, ControlCommand, ControlRequest, Frame, MatchId, SeekRequest,
    ServerMessage,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 分发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// 每场比赛保留的最近帧数
    pub ring_capacity: usize,
    pub default_frame_rate: u32,
    pub max_frame_rate: u32,
    /// 每个订阅者出站队列容量
    pub subscriber_queue: usize,
    /// 直播流超过该时长没有新帧时自动结束
    #[serde(with = "duration_ms")]
    pub match_idle_timeout: Duration,
    /// 已结束且无订阅者的流在注册表中保留的时长
    #[serde(with = "duration_ms")]
    pub stream_retention: Duration,
    #[serde(with = "duration_ms")]
    pub maintenance_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 10_000,
            default_frame_rate: 30,
            max_frame_rate: 60,
            subscriber_queue: 256,
            match_idle_timeout: Duration::from_secs(60),
            stream_retention: Duration::from_secs(300),
            maintenance_interval: Duration::from_secs(10),
        }
    }
}

/// 一轮维护的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub closed: Vec<MatchId>,
    pub removed: Vec<MatchId>,
}

#[derive(Default)]
struct FrameStats {
    total: AtomicU64,
    window: AtomicU64,
}

pub struct StreamHub {
    config: HubConfig,
    streams: DashMap<MatchId, Arc<MatchStream>>,
    capture: Option<Arc<dyn CaptureStorage>>,
    records: Option<Arc<dyn RecordStore>>,
    stats: FrameStats,
}

impl StreamHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            streams: DashMap::new(),
            capture: None,
            records: None,
            stats: FrameStats::default(),
        }
    }

    /// 关联采集存储，用于结束比赛时落盘和回放
    pub fn with_capture(mut self, capture: Arc<dyn CaptureStorage>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// 关联记录存储，流过期移除时一并删除其记录
    pub fn with_records(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// 按上限截断请求的帧率，未指定或非法时使用默认帧率
    pub fn clamp_frame_rate(&self, requested: Option<i64>) -> u32 {
        let max = self.config.max_frame_rate.max(1);
        match requested {
            Some(fps) if fps > 0 => fps.min(max as i64) as u32,
            _ => self.config.default_frame_rate.clamp(1, max),
        }
    }

    fn get_or_create(&self, match_id: &MatchId) -> Arc<MatchStream> {
        if let Some(stream) = self.streams.get(match_id) {
            return stream.value().clone();
        }

        self.streams
            .entry(match_id.clone())
            .or_insert_with(|| {
                info!("Created stream for match {}", match_id);
                Arc::new(MatchStream::new(match_id.clone(), self.config.ring_capacity))
            })
            .value()
            .clone()
    }

    pub fn stream(&self, match_id: &MatchId) -> Option<Arc<MatchStream>> {
        self.streams.get(match_id).map(|s| s.value().clone())
    }

    pub fn has_stream(&self, match_id: &MatchId) -> bool {
        self.streams.contains_key(match_id)
    }

    /// 广播一帧：写入比赛流缓冲，只序列化一次，推送给所有未暂停的订阅者。
    /// 订阅者队列满时只对该订阅者丢弃，不会阻塞调用方。
    pub fn broadcast_frame(&self, match_id: &MatchId, frame: Frame) -> usize {
        let message = match ServerMessage::frame_json(&frame) {
            Ok(json) => Arc::<str>::from(json),
            Err(e) => {
                error!("Failed to encode frame {} for {}: {}", frame.frame_index, match_id, e);
                return 0;
            }
        };

        self.stats.total.fetch_add(1, Ordering::Relaxed);
        self.stats.window.fetch_add(1, Ordering::Relaxed);

        let stream = self.get_or_create(match_id);
        stream.push_frame(frame, message)
    }

    /// 订阅比赛流，不存在时创建
    pub fn subscribe(&self, match_id: &MatchId, frame_rate: u32) -> Subscription {
        let frame_rate = self.clamp_frame_rate(Some(frame_rate as i64));
        let (session, outbound) = SubscriberSession::new(
            match_id.clone(),
            frame_rate,
            self.config.max_frame_rate,
            self.config.subscriber_queue,
        );

        let stream = self.get_or_create(match_id);
        stream.add_subscriber(session.clone());

        info!(
            "Subscriber {} joined stream {} at {} fps",
            session.id(),
            match_id,
            frame_rate
        );

        Subscription { session, outbound }
    }

    /// 取消订阅，重复调用无副作用
    pub fn unsubscribe(&self, session: &SubscriberSession) {
        session.close();

        let Some(stream) = self.stream(session.match_id()) else {
            return;
        };
        if stream.remove_subscriber(session.id()) {
            info!("Subscriber {} left stream {}", session.id(), session.match_id());
            if stream.subscriber_count() == 0 {
                debug!("Stream {} has no subscribers", session.match_id());
            }
        }
    }

    /// 定位请求；帧不存在或时间超出缓冲范围时静默忽略
    pub fn seek(&self, session: &SubscriberSession, request: &SeekRequest) -> bool {
        let Some(stream) = self.stream(session.match_id()) else {
            return false;
        };

        if let Some(frame_index) = request.frame.filter(|&index| index > 0) {
            return stream.seek_frame(session, frame_index);
        }

        if let Some(time) = &request.time {
            return match parse_seek_time(time) {
                Ok(offset) => stream.seek_time(session, offset),
                Err(e) => {
                    debug!("Ignoring seek from {}: {}", session.id(), e);
                    false
                }
            };
        }

        false
    }

    /// 播放控制
    pub fn control(&self, session: &SubscriberSession, request: &ControlRequest) {
        match request.command {
            ControlCommand::Pause => {
                session.pause();
                debug!("Subscriber {} paused", session.id());
            }
            ControlCommand::Play => {
                session.play();
                debug!("Subscriber {} resumed", session.id());
            }
            ControlCommand::Framerate => match session.set_frame_rate(request.framerate) {
                Some(rate) => debug!("Subscriber {} frame rate set to {}", session.id(), rate),
                None => debug!(
                    "Ignoring invalid frame rate {} from {}",
                    request.framerate,
                    session.id()
                ),
            },
        }
    }

    pub fn handle_client_message(&self, session: &SubscriberSession, message: &ClientMessage) {
        match message {
            ClientMessage::Control(request) => self.control(session, request),
            ClientMessage::Seek(request) => {
                self.seek(session, request);
            }
        }
    }

    /// 标记比赛结束并通知订阅者；之后再收到的帧仍会写入该流
    pub fn close_match(&self, match_id: &MatchId) -> bool {
        let Some(stream) = self.stream(match_id) else {
            return false;
        };

        let notice = match ServerMessage::MatchEnded.to_json() {
            Ok(json) => Arc::<str>::from(json),
            Err(e) => {
                error!("Failed to encode match_ended: {}", e);
                return false;
            }
        };

        let closed = stream.close(notice);
        if closed {
            info!("Match stream closed: {}", match_id);
        }
        closed
    }

    /// 回放已完成的采集文件；没有可用文件时返回 `None`
    pub async fn replay(&self, match_id: &MatchId, frame_rate: u32) -> Option<Subscription> {
        let capture = self.capture.as_ref()?;
        if !capture.is_complete(match_id).await {
            return None;
        }
        let path = capture.get_file(match_id).await.ok()?;

        let frame_rate = self.clamp_frame_rate(Some(frame_rate as i64));
        let (session, outbound) = SubscriberSession::new(
            match_id.clone(),
            frame_rate,
            self.config.max_frame_rate,
            self.config.subscriber_queue,
        );

        let subscribed = ServerMessage::Subscribed {
            match_id: match_id.to_string(),
            frame_count: 0,
            is_live: false,
        };
        if let Ok(json) = subscribed.to_json() {
            session.try_push(Arc::from(json));
        }

        tokio::spawn(replay::replay_capture(session.clone(), path));

        Some(Subscription { session, outbound })
    }

    pub fn list_streams(&self) -> Vec<StreamInfo> {
        let streams: Vec<Arc<MatchStream>> =
            self.streams.iter().map(|entry| entry.value().clone()).collect();
        streams.iter().map(|stream| stream.info()).collect()
    }

    pub fn stream_info(&self, match_id: &MatchId) -> Option<StreamInfo> {
        self.stream(match_id).map(|stream| stream.info())
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// 结束空闲的直播流，移除过期的已结束流
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        let streams: Vec<Arc<MatchStream>> =
            self.streams.iter().map(|entry| entry.value().clone()).collect();

        for stream in streams {
            if stream.is_idle(self.config.match_idle_timeout) {
                info!(
                    "Match {} idle for more than {:?}",
                    stream.match_id(),
                    self.config.match_idle_timeout
                );
                if self.close_match(stream.match_id()) {
                    report.closed.push(stream.match_id().clone());
                }
            }

            let retention = self.config.stream_retention;
            if self
                .streams
                .remove_if(stream.match_id(), |_, s| s.is_expired(retention))
                .is_some()
            {
                debug!("Removed expired stream {}", stream.match_id());
                report.removed.push(stream.match_id().clone());
            }
        }

        report
    }

    /// 执行一轮维护，并结束已关闭比赛的采集文件、删除已移除比赛的记录
    pub async fn maintain(&self) -> MaintenanceReport {
        let report = self.run_maintenance();

        if let Some(capture) = &self.capture {
            for match_id in &report.closed {
                if let Err(e) = capture.finish(match_id).await {
                    warn!("Failed to finish capture for {}: {}", match_id, e);
                }
            }
        }

        if let Some(records) = &self.records {
            for match_id in &report.removed {
                if let Err(e) = records.remove(match_id).await {
                    warn!("Failed to remove records for {}: {}", match_id, e);
                }
            }
        }

        if !report.removed.is_empty() {
            info!("Removed {} expired streams", report.removed.len());
        }
        report
    }

    /// 启动维护任务
    pub fn spawn_maintenance(self: &Arc<Self>, cancel: CancellationToken) {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(hub.config.maintenance_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                hub.maintain().await;
            }
        });
    }

    /// 每5秒输出一次帧统计
    pub fn spawn_stats_logger(self: &Arc<Self>, cancel: CancellationToken) {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let recent = hub.stats.window.swap(0, Ordering::Relaxed);
                if recent > 0 {
                    info!(
                        "Frame statistics: total={} last_5s={} active_streams={}",
                        hub.stats.total.load(Ordering::Relaxed),
                        recent,
                        hub.stream_count()
                    );
                }
            }
        });
    }

    pub fn frames_received(&self) -> u64 {
        self.stats.total.load(Ordering::Relaxed)
    }
}
