//! 磁盘溢出队列
//!
//! 链路长时间断开时，帧以 JSONL 形式（每行一个封装，与线路格式一致）追加到临时文件。
//! 重连后按顺序逐行重发，并记录已确认发送的字节偏移：
//! 中途失败时下一次排空从第一条未发送的记录继续。

use crate::error::Result;
use common::{Envelope, Frame};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct SpillQueue {
    dir: PathBuf,
    path: Option<PathBuf>,
    writer: Option<File>,
    /// 已写入的记录数
    appended: u64,
    /// 已确认发送的记录数
    drained: u64,
    /// 已确认发送的字节偏移
    offset: u64,
}

impl SpillQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            path: None,
            writer: None,
            appended: 0,
            drained: 0,
            offset: 0,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn pending(&self) -> u64 {
        self.appended - self.drained
    }

    pub fn has_pending(&self) -> bool {
        self.pending() > 0
    }

    /// 追加一帧；文件在第一次溢出时创建
    pub async fn append(&mut self, frame: &Frame) -> Result<()> {
        let line = Envelope::new(frame.clone()).to_line()?;

        if self.writer.is_none() {
            tokio::fs::create_dir_all(&self.dir).await?;
            let path = self.dir.join(format!("frame-spill-{}.jsonl", Uuid::new_v4()));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            info!("Started disk buffering: {:?}", path);
            self.path = Some(path);
            self.writer = Some(file);
        }

        if let Some(writer) = self.writer.as_mut() {
            let mut data = line.into_bytes();
            data.push(b'\n');
            writer.write_all(&data).await?;
        }

        self.appended += 1;
        if self.appended % 100 == 0 {
            debug!("Disk buffer progress: {} frames buffered", self.appended);
        }

        Ok(())
    }

    /// 从上次确认的偏移处打开读取器
    pub async fn reader(&mut self) -> Result<SpillReader> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().await?;
        }

        let path = match &self.path {
            Some(path) => path.clone(),
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "spill queue has no file",
                )
                .into())
            }
        };

        let mut file = File::open(&path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;

        Ok(SpillReader {
            reader: BufReader::new(file),
        })
    }

    /// 确认一条记录已发送
    pub fn commit(&mut self, bytes: u64) {
        self.offset += bytes;
        self.drained += 1;
    }

    /// 删除文件并重置状态
    pub async fn remove(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush().await;
        }

        if let Some(path) = self.path.take() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Cleaned up disk buffer file: {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove disk buffer file {:?}: {}", path, e),
            }
        }

        self.appended = 0;
        self.drained = 0;
        self.offset = 0;
    }
}

pub struct SpillReader {
    reader: BufReader<File>,
}

impl SpillReader {
    /// 读取下一条记录，返回去掉换行的内容及其在文件中占用的字节数
    pub async fn next_line(&mut self) -> Result<Option<(String, u64)>> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
        Ok(Some((trimmed, read as u64)))
    }
}
