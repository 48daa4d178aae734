use super::{CaptureStorage, Result};
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::Utc;
use common::{Envelope, Frame, MatchId};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

const CAPTURE_EXTENSION: &str = "jsonl";

/// 一轮清理的结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub remaining_bytes: u64,
}

struct MatchWriter {
    path: PathBuf,
    file: BufWriter<File>,
    frames: u64,
}

/// 按比赛落盘的 JSONL 采集存储
///
/// 每场比赛一个 `<时间>_<match_id>.jsonl` 文件，每行一个封装（与线路格式相同）。
pub struct JsonlCaptureStorage {
    dir: PathBuf,
    retention: Duration,
    max_size: u64,
    writers: Mutex<HashMap<MatchId, MatchWriter>>,
}

struct CaptureFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

impl JsonlCaptureStorage {
    pub fn new(dir: impl Into<PathBuf>, retention: Duration, max_size: u64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            retention,
            max_size,
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_suffix(match_id: &MatchId) -> String {
        format!("_{}.{}", match_id, CAPTURE_EXTENSION)
    }

    fn list_files(&self) -> Vec<CaptureFile> {
        WalkDir::new(&self.dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .map(|ext| ext == CAPTURE_EXTENSION)
                    .unwrap_or(false)
            })
            .filter_map(|entry| {
                let metadata = entry.metadata().ok()?;
                Some(CaptureFile {
                    path: entry.path().to_path_buf(),
                    size: metadata.len(),
                    modified: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
                })
            })
            .collect()
    }

    /// 该比赛最新的采集文件
    fn find_file(&self, match_id: &MatchId) -> Option<PathBuf> {
        let suffix = Self::file_suffix(match_id);
        let mut candidates: Vec<PathBuf> = self
            .list_files()
            .into_iter()
            .map(|file| file.path)
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.ends_with(&suffix))
                    .unwrap_or(false)
            })
            .collect();

        // 文件名以时间开头，取最新的一个
        candidates.sort();
        candidates.pop()
    }

    /// 关闭所有正在写入的文件
    pub async fn shutdown(&self) {
        let mut writers = self.writers.lock().await;
        for (match_id, mut writer) in writers.drain() {
            if let Err(e) = writer.file.flush().await {
                error!("Failed to close capture for {}: {}", match_id, e);
            }
        }
    }

    /// 启动定期清理任务，启动时先清理一次
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let storage = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = storage.cleanup().await {
                    error!("Capture cleanup failed: {}", e);
                }
            }
        });
    }
}

#[async_trait]
impl CaptureStorage for JsonlCaptureStorage {
    async fn write_frame(&self, match_id: &MatchId, frame: &Frame) -> Result<()> {
        let mut line = serde_json::to_string(&Envelope::new(frame.clone()))?;
        line.push('\n');

        let mut writers = self.writers.lock().await;
        if !writers.contains_key(match_id) {
            // 比赛结束后又收到帧时追加到原文件
            let path = match self.find_file(match_id) {
                Some(path) => {
                    info!("Reopened capture file for {}: {:?}", match_id, path);
                    path
                }
                None => {
                    let name = format!(
                        "{}{}",
                        Utc::now().format("%Y-%m-%d_%H-%M-%S"),
                        Self::file_suffix(match_id)
                    );
                    let path = self.dir.join(name);
                    info!("Created capture file for {}: {:?}", match_id, path);
                    path
                }
            };
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            writers.insert(
                match_id.clone(),
                MatchWriter {
                    path,
                    file: BufWriter::new(file),
                    frames: 0,
                },
            );
        }

        let writer = writers
            .get_mut(match_id)
            .ok_or_else(|| StorageError::WriterClosed(match_id.to_string()))?;
        writer.file.write_all(line.as_bytes()).await?;
        writer.frames += 1;
        Ok(())
    }

    async fn get_file(&self, match_id: &MatchId) -> Result<PathBuf> {
        if self.writers.lock().await.contains_key(match_id) {
            return Err(StorageError::InProgress(match_id.to_string()));
        }

        self.find_file(match_id)
            .ok_or_else(|| StorageError::NotFound(match_id.to_string()))
    }

    async fn is_complete(&self, match_id: &MatchId) -> bool {
        !self.writers.lock().await.contains_key(match_id)
    }

    async fn finish(&self, match_id: &MatchId) -> Result<()> {
        let writer = self.writers.lock().await.remove(match_id);
        if let Some(mut writer) = writer {
            writer.file.flush().await?;
            info!(
                "Closed capture file for {}: {} frames in {:?}",
                match_id, writer.frames, writer.path
            );
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<CleanupReport> {
        debug!("Running capture storage cleanup");

        let active: HashSet<PathBuf> = self
            .writers
            .lock()
            .await
            .values()
            .map(|writer| writer.path.clone())
            .collect();

        let mut files = self.list_files();
        let mut total: u64 = files.iter().map(|f| f.size).sum();
        let mut deleted = 0;
        let now = SystemTime::now();

        // 超过保留时间的文件
        files.retain(|file| {
            let age = now.duration_since(file.modified).unwrap_or_default();
            if age <= self.retention || active.contains(&file.path) {
                return true;
            }
            match std::fs::remove_file(&file.path) {
                Ok(()) => {
                    info!("Deleted old capture file {:?} (age {:?})", file.path, age);
                    total = total.saturating_sub(file.size);
                    deleted += 1;
                    false
                }
                Err(e) => {
                    warn!("Failed to delete old capture file {:?}: {}", file.path, e);
                    true
                }
            }
        });

        // 仍超过总大小上限时从最旧的开始删除
        if total > self.max_size {
            files.sort_by_key(|file| file.modified);
            for file in &files {
                if total <= self.max_size {
                    break;
                }
                if active.contains(&file.path) {
                    continue;
                }
                match std::fs::remove_file(&file.path) {
                    Ok(()) => {
                        info!("Deleted capture file {:?} for size limit ({} bytes)", file.path, file.size);
                        total = total.saturating_sub(file.size);
                        deleted += 1;
                    }
                    Err(e) => warn!("Failed to delete capture file {:?}: {}", file.path, e),
                }
            }
        }

        if deleted > 0 {
            info!("Capture cleanup completed: {} deleted, {} bytes remaining", deleted, total);
        }

        Ok(CleanupReport {
            deleted,
            remaining_bytes: total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn match_id() -> MatchId {
        MatchId::new(Uuid::new_v4(), "node-1").unwrap()
    }

    fn frame(index: u32) -> Frame {
        Frame::new(index, Utc::now(), json!({ "seq": index }))
    }

    fn storage(dir: &Path) -> JsonlCaptureStorage {
        JsonlCaptureStorage::new(dir, Duration::from_secs(3600), u64::MAX).unwrap()
    }

    #[tokio::test]
    async fn test_write_and_finish() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let id = match_id();

        for i in 1..=3 {
            storage.write_frame(&id, &frame(i)).await.unwrap();
        }

        assert!(!storage.is_complete(&id).await);
        assert!(matches!(
            storage.get_file(&id).await,
            Err(StorageError::InProgress(_))
        ));

        storage.finish(&id).await.unwrap();
        assert!(storage.is_complete(&id).await);

        let path = storage.get_file(&id).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let indices: Vec<u32> = content
            .lines()
            .map(|line| Envelope::from_line(line).unwrap().frame.unwrap().frame_index)
            .collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_frames_after_finish_append_to_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let id = match_id();

        storage.write_frame(&id, &frame(1)).await.unwrap();
        storage.write_frame(&id, &frame(2)).await.unwrap();
        storage.finish(&id).await.unwrap();
        let first = storage.get_file(&id).await.unwrap();

        storage.write_frame(&id, &frame(3)).await.unwrap();
        storage.finish(&id).await.unwrap();

        let path = storage.get_file(&id).await.unwrap();
        assert_eq!(path, first);
        assert_eq!(storage.list_files().len(), 1);

        let content = std::fs::read_to_string(&path).unwrap();
        let indices: Vec<u32> = content
            .lines()
            .map(|line| Envelope::from_line(line).unwrap().frame.unwrap().frame_index)
            .collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unknown_match_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());

        assert!(storage.is_complete(&match_id()).await);
        assert!(matches!(
            storage.get_file(&match_id()).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_by_age_keeps_active() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonlCaptureStorage::new(dir.path(), Duration::ZERO, u64::MAX).unwrap();
        let finished = match_id();
        let active = match_id();

        storage.write_frame(&finished, &frame(1)).await.unwrap();
        storage.finish(&finished).await.unwrap();
        storage.write_frame(&active, &frame(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = storage.cleanup().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(storage.get_file(&finished).await.is_err());

        storage.finish(&active).await.unwrap();
        assert!(storage.get_file(&active).await.is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonlCaptureStorage::new(dir.path(), Duration::from_secs(3600), 0).unwrap();

        let old = match_id();
        storage.write_frame(&old, &frame(1)).await.unwrap();
        storage.finish(&old).await.unwrap();

        let active = match_id();
        storage.write_frame(&active, &frame(1)).await.unwrap();

        let report = storage.cleanup().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(matches!(storage.get_file(&old).await, Err(StorageError::NotFound(_))));
        assert!(!storage.is_complete(&active).await);
    }
}
