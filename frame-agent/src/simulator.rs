// 模拟帧源
//
// 不依赖真实比赛进程，按固定频率生成确定性的遥测帧，
// 用于联调采集端和验证断线缓冲流程。

use chrono::{DateTime, Utc};
use common::Frame;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// 模拟帧源
pub struct FrameSimulator {
    session_id: Uuid,
    frequency: u32,
    next_index: u32,
}

impl FrameSimulator {
    /// 创建模拟帧源，`frequency` 为每秒帧数
    pub fn new(session_id: Uuid, frequency: u32) -> Self {
        Self {
            session_id,
            frequency: frequency.max(1),
            next_index: 1,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// 生成下一帧，序号从1开始递增
    pub fn next_frame(&mut self, timestamp: DateTime<Utc>) -> Frame {
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);

        let game_clock = index as f64 / self.frequency as f64;
        // 每30秒游戏时间交替得分
        let period = (game_clock / 30.0) as u64;
        let payload = json!({
            "game_clock": game_clock,
            "game_status": "playing",
            "blue_points": (period + 1) / 2,
            "orange_points": period / 2,
        });

        Frame::new(index, timestamp, payload).with_session(self.session_id)
    }

    /// 启动生成任务，取消后通道关闭
    pub fn start(mut self, cancel: CancellationToken) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(100);
        let period = Duration::from_secs_f64(1.0 / self.frequency as f64);

        info!(
            "Starting frame simulator: session {}, {} fps",
            self.session_id, self.frequency
        );

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let frame = self.next_frame(Utc::now());
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }

            debug!("Frame simulator stopped after {} frames", self.next_index - 1);
        });

        rx
    }
}
