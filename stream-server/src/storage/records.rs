use super::{RecordStore, Result};
use async_trait::async_trait;
use common::{Frame, MatchId};
use dashmap::DashMap;
use std::collections::VecDeque;

/// 内存记录存储，每场比赛最多保留 `max_per_match` 帧
pub struct MemoryRecordStore {
    max_per_match: usize,
    records: DashMap<MatchId, VecDeque<Frame>>,
}

impl MemoryRecordStore {
    pub fn new(max_per_match: usize) -> Self {
        Self {
            max_per_match: max_per_match.max(1),
            records: DashMap::new(),
        }
    }

    pub fn match_count(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn store(&self, match_id: &MatchId, frame: &Frame) -> Result<()> {
        let mut frames = self.records.entry(match_id.clone()).or_default();
        if frames.len() >= self.max_per_match {
            frames.pop_front();
        }
        frames.push_back(frame.clone());
        Ok(())
    }

    async fn query_paginated(
        &self,
        match_id: &MatchId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Frame>, usize)> {
        let Some(frames) = self.records.get(match_id) else {
            return Ok((Vec::new(), 0));
        };

        let page = frames.iter().skip(offset).take(limit).cloned().collect();
        Ok((page, frames.len()))
    }

    async fn remove(&self, match_id: &MatchId) -> Result<bool> {
        Ok(self.records.remove(match_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn match_id() -> MatchId {
        MatchId::new(Uuid::new_v4(), "node-1").unwrap()
    }

    #[tokio::test]
    async fn test_query_paginated() {
        let store = MemoryRecordStore::new(100);
        let id = match_id();
        for i in 1..=25 {
            store
                .store(&id, &Frame::new(i, Utc::now(), json!({ "seq": i })))
                .await
                .unwrap();
        }

        let (page, total) = store.query_paginated(&id, 10, 20).await.unwrap();
        assert_eq!(total, 25);
        let indices: Vec<u32> = page.iter().map(|f| f.frame_index).collect();
        assert_eq!(indices, vec![21, 22, 23, 24, 25]);

        let (empty, total) = store.query_paginated(&match_id(), 10, 0).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_bounded_per_match() {
        let store = MemoryRecordStore::new(3);
        let id = match_id();
        for i in 1..=5 {
            store.store(&id, &Frame::new(i, Utc::now(), json!(null))).await.unwrap();
        }

        let (page, total) = store.query_paginated(&id, 10, 0).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.first().unwrap().frame_index, 3);
    }

    #[tokio::test]
    async fn test_remove_match() {
        let store = MemoryRecordStore::new(10);
        let id = match_id();
        let other = match_id();
        store.store(&id, &Frame::new(1, Utc::now(), json!(null))).await.unwrap();
        store.store(&other, &Frame::new(1, Utc::now(), json!(null))).await.unwrap();

        assert!(store.remove(&id).await.unwrap());
        assert!(!store.remove(&id).await.unwrap());
        assert_eq!(store.match_count(), 1);

        let (_, total) = store.query_paginated(&id, 10, 0).await.unwrap();
        assert_eq!(total, 0);
    }
}
