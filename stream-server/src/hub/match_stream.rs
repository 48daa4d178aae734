use super::ring::{FrameRing, RingEntry};
use super::session::SubscriberSession;
use chrono::{DateTime, Utc};
use common::{Frame, MatchId, ServerMessage};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// 比赛流概况
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StreamInfo {
    pub match_id: String,
    pub status: &'static str,
    pub subscribers: usize,
    pub frames: usize,
    pub start_time: i64,
}

/// 单场比赛的流状态：最近帧的环形缓冲 + 订阅者集合
///
/// 缓冲和订阅者只在持有本流的锁时修改，不同比赛之间互不竞争。
pub struct MatchStream {
    match_id: MatchId,
    started_at: DateTime<Utc>,
    state: Mutex<StreamState>,
}

struct StreamState {
    ring: FrameRing,
    subscribers: HashMap<Uuid, Arc<SubscriberSession>>,
    live: bool,
    /// 本流见过的第一帧时间戳，按时间定位以它为零点
    first_timestamp: Option<DateTime<Utc>>,
    last_frame_at: Instant,
    closed_at: Option<Instant>,
}

impl MatchStream {
    pub fn new(match_id: MatchId, ring_capacity: usize) -> Self {
        Self {
            match_id,
            started_at: Utc::now(),
            state: Mutex::new(StreamState {
                ring: FrameRing::new(ring_capacity),
                subscribers: HashMap::new(),
                live: true,
                first_timestamp: None,
                last_frame_at: Instant::now(),
                closed_at: None,
            }),
        }
    }

    pub fn match_id(&self) -> &MatchId {
        &self.match_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// 写入一帧并推送给所有未暂停的订阅者，返回成功入队的订阅者数量
    pub fn push_frame(&self, frame: Frame, message: Arc<str>) -> usize {
        let mut state = self.state.lock();

        if state.first_timestamp.is_none() {
            state.first_timestamp = Some(frame.timestamp);
        }
        state.last_frame_at = Instant::now();
        if !state.live {
            debug!("Frame received for closed stream {}, marking live again", self.match_id);
            state.live = true;
            state.closed_at = None;
        }

        state.ring.push(RingEntry::new(frame, message.clone()));

        state
            .subscribers
            .values()
            .filter(|session| !session.is_paused())
            .filter(|session| session.try_push(message.clone()))
            .count()
    }

    /// 注册订阅者；`subscribed` 消息先于任何帧进入队列
    pub fn add_subscriber(&self, session: Arc<SubscriberSession>) {
        let mut state = self.state.lock();

        let subscribed = ServerMessage::Subscribed {
            match_id: self.match_id.to_string(),
            frame_count: state.ring.len(),
            is_live: state.live,
        };
        if let Ok(json) = subscribed.to_json() {
            session.try_push(Arc::from(json));
        }

        state.subscribers.insert(session.id(), session);
    }

    pub fn remove_subscriber(&self, session_id: Uuid) -> bool {
        self.state.lock().subscribers.remove(&session_id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn frame_count(&self) -> usize {
        self.state.lock().ring.len()
    }

    pub fn is_live(&self) -> bool {
        self.state.lock().live
    }

    /// 按帧序号定位：帧仍在缓冲中时立即推送给该订阅者
    pub fn seek_frame(&self, session: &SubscriberSession, frame_index: u32) -> bool {
        let message = {
            let state = self.state.lock();
            match state.ring.get(frame_index) {
                Some(entry) => entry.message.clone(),
                None => return false,
            }
        };
        session.try_push(message)
    }

    /// 按相对第一帧的时间偏移定位
    ///
    /// 推送第一个时间戳不早于目标时间的帧；目标早于最旧的缓冲帧或晚于最新帧时不做任何事。
    pub fn seek_time(&self, session: &SubscriberSession, offset: Duration) -> bool {
        let message = {
            let state = self.state.lock();
            let Some(first) = state.first_timestamp else {
                return false;
            };
            // 超出 chrono 可表示范围的偏移视为无效定位
            let Some(target) = chrono::Duration::from_std(offset)
                .ok()
                .and_then(|offset| first.checked_add_signed(offset))
            else {
                return false;
            };

            let (Some(oldest), Some(newest)) = (state.ring.oldest(), state.ring.newest()) else {
                return false;
            };
            if target < oldest.frame.timestamp || target > newest.frame.timestamp {
                return false;
            }

            match state.ring.first_at_or_after(target) {
                Some(entry) => entry.message.clone(),
                None => return false,
            }
        };
        session.try_push(message)
    }

    /// 标记比赛结束并通知所有订阅者；已结束时返回 false
    pub fn close(&self, notice: Arc<str>) -> bool {
        let mut state = self.state.lock();
        if !state.live {
            return false;
        }

        state.live = false;
        state.closed_at = Some(Instant::now());

        for session in state.subscribers.values() {
            session.try_push(notice.clone());
        }
        true
    }

    /// 仍在直播但超过 `timeout` 没有收到帧
    pub fn is_idle(&self, timeout: Duration) -> bool {
        let state = self.state.lock();
        state.live && state.last_frame_at.elapsed() > timeout
    }

    /// 已结束、没有订阅者且超过保留时间
    pub fn is_expired(&self, retention: Duration) -> bool {
        let state = self.state.lock();
        !state.live
            && state.subscribers.is_empty()
            && state
                .closed_at
                .map(|at| at.elapsed() > retention)
                .unwrap_or(false)
    }

    pub fn info(&self) -> StreamInfo {
        let state = self.state.lock();
        StreamInfo {
            match_id: self.match_id.to_string(),
            status: if state.live { "live" } else { "ended" },
            subscribers: state.subscribers.len(),
            frames: state.ring.len(),
            start_time: self.started_at.timestamp(),
        }
    }
}
