//! 外部存储协作者
//!
//! 采集存储负责把每场比赛的帧落盘，记录存储负责按比赛分页查询历史帧。
//! 两者的失败只记录警告，不影响实时分发。

mod capture;
mod records;

pub use capture::{CleanupReport, JsonlCaptureStorage};
pub use records::MemoryRecordStore;

use crate::error::StorageError;
use async_trait::async_trait;
use common::{Frame, MatchId};
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, StorageError>;

/// 采集存储
#[async_trait]
pub trait CaptureStorage: Send + Sync + 'static {
    async fn write_frame(&self, match_id: &MatchId, frame: &Frame) -> Result<()>;

    /// 已完成比赛的采集文件路径
    async fn get_file(&self, match_id: &MatchId) -> Result<PathBuf>;

    /// 比赛没有正在写入的文件
    async fn is_complete(&self, match_id: &MatchId) -> bool;

    /// 结束比赛并关闭其文件
    async fn finish(&self, match_id: &MatchId) -> Result<()>;

    /// 按保留时间和总大小清理旧文件
    async fn cleanup(&self) -> Result<CleanupReport>;
}

/// 历史帧记录存储
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    async fn store(&self, match_id: &MatchId, frame: &Frame) -> Result<()>;

    /// 返回 `(帧, 总数)`
    async fn query_paginated(
        &self,
        match_id: &MatchId,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Frame>, usize)>;

    /// 删除一场比赛的全部记录，返回是否存在
    async fn remove(&self, match_id: &MatchId) -> Result<bool>;
}
