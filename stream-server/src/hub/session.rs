use common::MatchId;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// 订阅会话
///
/// 一个观察者的连接状态：独立的帧率、暂停标志和有界出站队列。
/// 队列中是已经序列化好的消息，广播时只复制引用。
pub struct SubscriberSession {
    id: Uuid,
    match_id: MatchId,
    frame_rate: AtomicU32,
    max_frame_rate: u32,
    paused: AtomicBool,
    tx: mpsc::Sender<Arc<str>>,
    cancel: CancellationToken,
}

/// 一次订阅：会话句柄 + 出站队列的接收端（由发送泵独占）
pub struct Subscription {
    pub session: Arc<SubscriberSession>,
    pub outbound: mpsc::Receiver<Arc<str>>,
}

impl SubscriberSession {
    pub fn new(
        match_id: MatchId,
        frame_rate: u32,
        max_frame_rate: u32,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let max_frame_rate = max_frame_rate.max(1);
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));

        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            match_id,
            frame_rate: AtomicU32::new(frame_rate.clamp(1, max_frame_rate)),
            max_frame_rate,
            paused: AtomicBool::new(false),
            tx,
            cancel: CancellationToken::new(),
        });

        (session, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn match_id(&self) -> &MatchId {
        &self.match_id
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate.load(Ordering::Relaxed)
    }

    /// 每条消息之间的最小间隔
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate().max(1)
    }

    /// 修改帧率：小于等于0的值被忽略，超过上限的值被截断。返回生效的帧率。
    pub fn set_frame_rate(&self, requested: i64) -> Option<u32> {
        if requested <= 0 {
            return None;
        }
        let rate = requested.min(self.max_frame_rate as i64) as u32;
        self.frame_rate.store(rate, Ordering::Relaxed);
        Some(rate)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn play(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// 非阻塞入队；队列满或会话已关闭时丢弃
    pub fn try_push(&self, message: Arc<str>) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Subscriber {} queue full, dropping message", self.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// 等待队列有空位后入队，会话关闭时返回 false
    pub async fn push(&self, message: Arc<str>) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            result = self.tx.send(message) => result.is_ok(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn match_id() -> MatchId {
        MatchId::new(Uuid::new_v4(), "node").unwrap()
    }

    #[test]
    fn test_initial_rate_clamped() {
        let (session, _rx) = SubscriberSession::new(match_id(), 500, 60, 8);
        assert_eq!(session.frame_rate(), 60);

        let (session, _rx) = SubscriberSession::new(match_id(), 0, 60, 8);
        assert_eq!(session.frame_rate(), 1);
    }

    #[test]
    fn test_set_frame_rate() {
        let (session, _rx) = SubscriberSession::new(match_id(), 30, 60, 8);

        assert_eq!(session.set_frame_rate(15), Some(15));
        assert_eq!(session.frame_interval(), Duration::from_secs(1) / 15);
        assert_eq!(session.set_frame_rate(240), Some(60));
        assert_eq!(session.set_frame_rate(0), None);
        assert_eq!(session.set_frame_rate(-5), None);
        assert_eq!(session.frame_rate(), 60);
    }

    #[test]
    fn test_try_push_drops_when_full() {
        let (session, mut rx) = SubscriberSession::new(match_id(), 30, 60, 2);

        assert!(session.try_push(Arc::from("a")));
        assert!(session.try_push(Arc::from("b")));
        assert!(!session.try_push(Arc::from("c")));

        assert_eq!(&*rx.try_recv().unwrap(), "a");
        assert_eq!(&*rx.try_recv().unwrap(), "b");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_push_returns_false_after_close() {
        let (session, _rx) = SubscriberSession::new(match_id(), 30, 60, 1);
        assert!(session.push(Arc::from("a")).await);

        session.close();
        // 队列已满，关闭后不再等待
        assert!(!session.push(Arc::from("b")).await);
        assert!(session.is_closed());
    }
}
