//! 入站帧处理
//!
//! 每条双向流上按行读取封装，逐条回复确认。处理顺序：先广播，再写采集存储和记录存储，
//! 存储失败只记录警告。

mod server;

pub use server::IngestServer;

use crate::hub::StreamHub;
use crate::storage::{CaptureStorage, RecordStore};
use common::{Envelope, IngestAck, MatchId};
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

/// 单行封装的最大长度
const MAX_LINE_LENGTH: usize = 1024 * 1024;

#[derive(Clone)]
pub struct IngestPipeline {
    hub: Arc<StreamHub>,
    capture: Option<Arc<dyn CaptureStorage>>,
    records: Option<Arc<dyn RecordStore>>,
    node_id: String,
}

impl IngestPipeline {
    pub fn new(hub: Arc<StreamHub>, node_id: impl Into<String>) -> Self {
        Self {
            hub,
            capture: None,
            records: None,
            node_id: node_id.into(),
        }
    }

    pub fn with_capture(mut self, capture: Arc<dyn CaptureStorage>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_records(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    /// 处理一行；保活封装不需要确认，返回 `None`
    pub async fn process_line(&self, line: &str) -> Option<IngestAck> {
        if line.len() > MAX_LINE_LENGTH {
            return Some(IngestAck::failed("message too large"));
        }

        let envelope = match Envelope::from_line(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Rejecting malformed envelope: {}", e);
                return Some(IngestAck::failed(format!("invalid envelope: {}", e)));
            }
        };

        let frame = envelope.frame?;

        let Some(session_id) = frame.session_id else {
            return Some(IngestAck::failed("frame has no session_id"));
        };
        let match_id = match MatchId::new(session_id, self.node_id.clone()) {
            Ok(id) => id,
            Err(e) => return Some(IngestAck::failed(e.to_string())),
        };

        self.hub.broadcast_frame(&match_id, frame.clone());

        if let Some(capture) = &self.capture {
            if let Err(e) = capture.write_frame(&match_id, &frame).await {
                warn!("Failed to write frame {} to capture: {}", frame.frame_index, e);
            }
        }
        if let Some(records) = &self.records {
            if let Err(e) = records.store(&match_id, &frame).await {
                warn!("Failed to store frame {}: {}", frame.frame_index, e);
            }
        }

        Some(IngestAck::ok())
    }

    /// 读取直到对端关闭，返回处理的消息数
    ///
    /// 按行分帧且限制单行长度，超长的行回复失败确认后丢弃，不会无限缓冲。
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut processed = 0u64;
        let mut recovering = false;

        loop {
            let next = match lines.next().await {
                Some(next) => next,
                // 解码出错后会先返回一次 None，之后继续读取
                None if recovering => {
                    recovering = false;
                    continue;
                }
                None => break,
            };
            recovering = false;

            let ack = match next {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    processed += 1;
                    match self.process_line(line).await {
                        Some(ack) => ack,
                        None => continue,
                    }
                }
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    processed += 1;
                    recovering = true;
                    warn!("Rejecting envelope longer than {} bytes", MAX_LINE_LENGTH);
                    IngestAck::failed("message too large")
                }
                Err(LinesCodecError::Io(e)) => return Err(e),
            };

            let mut response = serde_json::to_string(&ack)?;
            response.push('\n');
            writer.write_all(response.as_bytes()).await?;
        }

        writer.flush().await?;
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use crate::storage::{MemoryRecordStore, RecordStore};
    use chrono::Utc;
    use common::Frame;
    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use uuid::Uuid;

    fn line(frame: Frame) -> String {
        format!("{}\n", Envelope::new(frame).to_line().unwrap())
    }

    #[tokio::test]
    async fn test_serve_acks_each_envelope() {
        let hub = Arc::new(StreamHub::new(HubConfig::default()));
        let records = Arc::new(MemoryRecordStore::new(100));
        let pipeline = IngestPipeline::new(hub.clone(), "node-a").with_records(records.clone());

        let session = Uuid::new_v4();
        let mut input = String::new();
        input.push_str(&line(Frame::new(1, Utc::now(), json!({"a": 1})).with_session(session)));
        input.push_str("{}\n");
        input.push_str(&line(Frame::new(2, Utc::now(), json!({"a": 2}))));
        input.push_str("not json\n");
        input.push_str(&line(Frame::new(3, Utc::now(), json!({"a": 3})).with_session(session)));

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        client_write.write_all(input.as_bytes()).await.unwrap();
        client_write.shutdown().await.unwrap();

        let processed = pipeline
            .serve(server_read, server_write)
            .await
            .unwrap();
        assert_eq!(processed, 5);

        let mut output = String::new();
        client_read.read_to_string(&mut output).await.unwrap();
        let acks: Vec<IngestAck> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(acks.len(), 4);
        assert!(acks[0].success);
        assert!(!acks[1].success);
        assert!(!acks[2].success);
        assert!(acks[3].success);

        let match_id = MatchId::new(session, "node-a").unwrap();
        let info = hub.stream_info(&match_id).unwrap();
        assert_eq!(info.frames, 2);

        let (frames, total) = records.query_paginated(&match_id, 10, 0).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(frames[1].frame_index, 3);
    }

    #[tokio::test]
    async fn test_oversized_line_is_rejected_without_closing() {
        let hub = Arc::new(StreamHub::new(HubConfig::default()));
        let pipeline = IngestPipeline::new(hub.clone(), "node-a");
        let session = Uuid::new_v4();

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let writer = tokio::spawn(async move {
            let oversized = vec![b'x'; MAX_LINE_LENGTH + 1024];
            client_write.write_all(&oversized).await.unwrap();
            client_write.write_all(b"\n").await.unwrap();
            let valid = line(Frame::new(1, Utc::now(), json!({})).with_session(session));
            client_write.write_all(valid.as_bytes()).await.unwrap();
            client_write.shutdown().await.unwrap();
        });
        let reader = tokio::spawn(async move {
            let mut output = String::new();
            client_read.read_to_string(&mut output).await.unwrap();
            output
        });

        let processed = pipeline.serve(server_read, server_write).await.unwrap();
        writer.await.unwrap();
        let output = reader.await.unwrap();

        assert_eq!(processed, 2);
        let acks: Vec<IngestAck> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0], IngestAck::failed("message too large"));
        assert!(acks[1].success);
        assert_eq!(hub.stream_count(), 1);
    }

    #[tokio::test]
    async fn test_keepalive_has_no_ack() {
        let hub = Arc::new(StreamHub::new(HubConfig::default()));
        let pipeline = IngestPipeline::new(hub.clone(), "node-a");

        assert!(pipeline.process_line("{}").await.is_none());
        assert_eq!(hub.stream_count(), 0);
    }
}
