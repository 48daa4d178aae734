use chrono::{DateTime, Utc};
use common::Frame;
use std::collections::HashMap;
use std::sync::Arc;

/// 环形缓冲中的一项：帧本身和预先序列化好的 `frame` 消息
#[derive(Debug, Clone)]
pub struct RingEntry {
    pub frame: Arc<Frame>,
    pub message: Arc<str>,
}

impl RingEntry {
    pub fn new(frame: Frame, message: impl Into<Arc<str>>) -> Self {
        Self {
            frame: Arc::new(frame),
            message: message.into(),
        }
    }

    pub fn frame_index(&self) -> u32 {
        self.frame.frame_index
    }
}

/// 带帧序号索引的固定容量环形缓冲
///
/// 保存最近 `capacity` 帧（按到达顺序），`index` 始终与缓冲内容一致：
/// 淘汰时只删除仍指向被淘汰槽位的索引项；重复的帧序号指向最新的槽位。
pub struct FrameRing {
    slots: Vec<Option<RingEntry>>,
    /// 下一次写入的槽位
    head: usize,
    len: usize,
    index: HashMap<u32, usize>,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 写入一帧，缓冲已满时返回被淘汰的最旧项
    pub fn push(&mut self, entry: RingEntry) -> Option<RingEntry> {
        let slot = self.head;

        let evicted = self.slots[slot].take();
        if let Some(old) = &evicted {
            if self.index.get(&old.frame_index()) == Some(&slot) {
                self.index.remove(&old.frame_index());
            }
        }

        self.index.insert(entry.frame_index(), slot);
        self.slots[slot] = Some(entry);
        self.head = (self.head + 1) % self.capacity();
        self.len = (self.len + 1).min(self.capacity());

        evicted
    }

    /// 按帧序号查找
    pub fn get(&self, frame_index: u32) -> Option<&RingEntry> {
        self.index
            .get(&frame_index)
            .and_then(|&slot| self.slots[slot].as_ref())
    }

    pub fn contains(&self, frame_index: u32) -> bool {
        self.index.contains_key(&frame_index)
    }

    fn start(&self) -> usize {
        if self.len < self.capacity() {
            0
        } else {
            self.head
        }
    }

    pub fn oldest(&self) -> Option<&RingEntry> {
        if self.is_empty() {
            return None;
        }
        self.slots[self.start()].as_ref()
    }

    pub fn newest(&self) -> Option<&RingEntry> {
        if self.is_empty() {
            return None;
        }
        let slot = (self.head + self.capacity() - 1) % self.capacity();
        self.slots[slot].as_ref()
    }

    /// 按到达顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &RingEntry> + '_ {
        let start = self.start();
        let capacity = self.capacity();
        (0..self.len).filter_map(move |i| self.slots[(start + i) % capacity].as_ref())
    }

    /// 第一个时间戳不早于 `target` 的帧
    pub fn first_at_or_after(&self, target: DateTime<Utc>) -> Option<&RingEntry> {
        self.iter().find(|entry| entry.frame.timestamp >= target)
    }
}
