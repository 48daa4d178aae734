use super::{LinkShared, SharedSink, SpillQueue};
use crate::error::{LinkError, Result};
use common::{BufferMode, ConnectionState, Envelope, Frame};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// 分发任务：唯一消费出站队列的任务
///
/// 断线期间的帧按到达顺序进入内存队列或磁盘溢出队列，
/// 重连后按“内存 -> 磁盘 -> 实时”的顺序发送，保证整体有序。
pub(crate) struct Dispatcher {
    shared: Arc<LinkShared>,
    outbound_rx: mpsc::Receiver<Frame>,
    state_rx: watch::Receiver<ConnectionState>,
    held: VecDeque<Frame>,
    spill: SpillQueue,
}

impl Dispatcher {
    pub(crate) fn new(
        shared: Arc<LinkShared>,
        outbound_rx: mpsc::Receiver<Frame>,
        state_rx: watch::Receiver<ConnectionState>,
    ) -> Self {
        let spill = SpillQueue::new(shared.config().spill_dir.clone());
        Self {
            shared,
            outbound_rx,
            state_rx,
            held: VecDeque::new(),
            spill,
        }
    }

    pub(crate) async fn run(mut self) {
        let cancel = self.shared.cancel_token().clone();
        let ping_interval = self.shared.config().ping_interval;
        let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.shared.current_sink() {
                Some((generation, sink)) => {
                    if !self.held.is_empty() || self.spill.has_pending() {
                        self.catch_up(generation, &sink).await;
                        continue;
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.state_rx.changed() => {}
                        _ = ping.tick() => {
                            let result = {
                                let mut guard = sink.lock().await;
                                match tokio::time::timeout(
                                    self.shared.config().write_timeout,
                                    guard.send_ping(),
                                )
                                .await
                                {
                                    Ok(result) => result,
                                    Err(_) => Err(LinkError::Timeout),
                                }
                            };
                            if let Err(e) = result {
                                warn!("Keepalive failed, triggering reconnect: {}", e);
                                self.shared.mark_disconnected(generation);
                            }
                        }
                        frame = self.outbound_rx.recv() => match frame {
                            Some(frame) => self.send_live(generation, &sink, frame).await,
                            None => break,
                        },
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.state_rx.changed() => {}
                        frame = self.outbound_rx.recv() => match frame {
                            Some(frame) => self.buffer(frame).await,
                            None => break,
                        },
                    }
                }
            }
        }

        self.spill.remove().await;
        debug!("Dispatch loop stopped");
    }

    async fn send_live(&mut self, generation: u64, sink: &SharedSink, frame: Frame) {
        let line = match Envelope::new(frame.clone()).to_line() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode frame {}: {}", frame.frame_index, e);
                self.shared.record_dropped();
                return;
            }
        };

        match self.write_line(sink, &line).await {
            Ok(()) => self.shared.record_sent(),
            Err(e) => {
                warn!("Write failed, triggering reconnect: {}", e);
                // 放回队首，重连后第一个发送
                self.held.push_front(frame);
                self.shared.mark_disconnected(generation);
            }
        }
    }

    /// 断线期间缓冲一帧
    async fn buffer(&mut self, frame: Frame) {
        let disconnected_for = self.shared.disconnected_for().unwrap_or(Duration::ZERO);
        let threshold = self.shared.config().disk_buffer_threshold;

        // 磁盘上仍有未发送的帧时，新帧必须排在它们之后
        if self.spill.has_pending() || disconnected_for > threshold {
            if self.shared.buffer_mode() == BufferMode::Memory {
                info!(
                    "Disconnected for {:?}, switching to disk buffering",
                    disconnected_for
                );
                self.shared.set_buffer_mode(BufferMode::Disk);
            }

            match self.spill.append(&frame).await {
                Ok(()) => self.shared.record_spilled(),
                Err(e) => {
                    error!("Failed to write frame {} to disk buffer: {}", frame.frame_index, e);
                    self.shared.record_dropped();
                }
            }
            return;
        }

        if self.held.len() >= self.shared.config().queue_capacity {
            warn!(
                "Memory buffer full while disconnected, dropping frame {}",
                frame.frame_index
            );
            self.shared.record_dropped();
            return;
        }

        self.held.push_back(frame);
    }

    /// 重连后补发：先内存队列，再磁盘队列
    async fn catch_up(&mut self, generation: u64, sink: &SharedSink) {
        if !self.held.is_empty() {
            info!("Resending {} buffered frames", self.held.len());
        }

        while let Some(frame) = self.held.pop_front() {
            let line = match Envelope::new(frame.clone()).to_line() {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to encode frame {}: {}", frame.frame_index, e);
                    self.shared.record_dropped();
                    continue;
                }
            };

            if let Err(e) = self.write_line(sink, &line).await {
                warn!("Resend failed, triggering reconnect: {}", e);
                self.held.push_front(frame);
                self.shared.mark_disconnected(generation);
                return;
            }
            self.shared.record_sent();
        }

        if self.spill.has_pending() {
            if let Err(e) = self.drain_spill(generation, sink).await {
                warn!("Disk buffer catch-up interrupted: {}", e);
                return;
            }
        }

        if self.shared.buffer_mode() == BufferMode::Disk {
            info!("Catch-up complete, switching back to memory mode");
            self.shared.set_buffer_mode(BufferMode::Memory);
        }
    }

    /// 按批次排空磁盘队列；中断后下次从第一条未发送的记录继续
    async fn drain_spill(&mut self, generation: u64, sink: &SharedSink) -> Result<()> {
        let batch_size = self.shared.config().catch_up_batch_size.max(1);
        let batch_interval = self.shared.config().catch_up_batch_interval;
        let cancel = self.shared.cancel_token().clone();

        info!("Catching up {} frames from disk buffer", self.spill.pending());

        let mut reader = match self.spill.reader().await {
            Ok(reader) => reader,
            Err(e) => {
                error!("Failed to open disk buffer, discarding it: {}", e);
                self.spill.remove().await;
                return Ok(());
            }
        };

        let mut sent = 0u64;
        let mut in_batch = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(LinkError::Closed);
            }

            let (line, bytes) = match reader.next_line().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read disk buffer, discarding remainder: {}", e);
                    break;
                }
            };

            if line.trim().is_empty() {
                self.spill.commit(bytes);
                continue;
            }

            if let Err(e) = self.write_line(sink, &line).await {
                self.shared.mark_disconnected(generation);
                return Err(e);
            }

            self.spill.commit(bytes);
            self.shared.record_sent();
            sent += 1;
            in_batch += 1;

            if in_batch >= batch_size {
                in_batch = 0;
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LinkError::Closed),
                    _ = tokio::time::sleep(batch_interval) => {}
                }
            }
        }

        info!("Disk buffer catch-up complete: {} frames sent", sent);
        self.spill.remove().await;
        Ok(())
    }

    async fn write_line(&self, sink: &SharedSink, line: &str) -> Result<()> {
        let mut guard = sink.lock().await;
        match tokio::time::timeout(self.shared.config().write_timeout, guard.send_line(line)).await
        {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout),
        }
    }
}
