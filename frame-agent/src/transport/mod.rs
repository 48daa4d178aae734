//! 链路传输抽象
//!
//! 帧链路只通过这里的 trait 访问网络，每条消息是一行 JSON（不含换行符）。

mod quic;

pub use quic::QuicConnector;

use crate::error::Result;
use async_trait::async_trait;

/// 已建立的连接：写半部 + 读半部
pub struct LinkConnection {
    pub sink: Box<dyn MessageSink>,
    pub stream: Box<dyn MessageStream>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<LinkConnection>;
}

#[async_trait]
pub trait MessageSink: Send + 'static {
    async fn send_line(&mut self, line: &str) -> Result<()>;

    /// 保活：发送不带帧的空封装
    async fn send_ping(&mut self) -> Result<()> {
        self.send_line("{}").await
    }

    async fn close(&mut self);
}

#[async_trait]
pub trait MessageStream: Send + 'static {
    /// 读取下一行；`None` 表示对端正常关闭
    async fn next_line(&mut self) -> Option<Result<String>>;
}
