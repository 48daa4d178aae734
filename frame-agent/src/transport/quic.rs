use super::{Connector, LinkConnection, MessageSink, MessageStream};
use crate::error::{LinkError, Result};
use async_trait::async_trait;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, info};

/// QUIC 连接器：每次连接打开一条双向流，按行收发 JSON
pub struct QuicConnector {
    endpoint: Endpoint,
    server_addr: SocketAddr,
    server_name: String,
}

impl QuicConnector {
    pub fn new(server_addr: SocketAddr, server_name: impl Into<String>) -> Result<Self> {
        let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
            .map_err(|e| LinkError::ConnectionFailed(format!("Failed to bind endpoint: {}", e)))?;

        // 配置客户端（跳过证书验证，采集端使用自签名证书）
        let crypto = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();

        let mut client_config = ClientConfig::new(Arc::new(crypto));
        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_concurrent_bidi_streams(4_u32.into());
        transport_config.max_idle_timeout(Duration::from_secs(60).try_into().ok());
        client_config.transport_config(Arc::new(transport_config));

        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            server_addr,
            server_name: server_name.into(),
        })
    }
}

#[async_trait]
impl Connector for QuicConnector {
    async fn connect(&self) -> Result<LinkConnection> {
        let connection = self
            .endpoint
            .connect(self.server_addr, &self.server_name)
            .map_err(|e| LinkError::ConnectionFailed(e.to_string()))?
            .await
            .map_err(|e| LinkError::ConnectionFailed(e.to_string()))?;

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| LinkError::ConnectionFailed(e.to_string()))?;

        info!("Connected to collector at {}", self.server_addr);

        Ok(LinkConnection {
            sink: Box::new(QuicSink { connection, send }),
            stream: Box::new(QuicStream {
                lines: BufReader::new(recv).lines(),
            }),
        })
    }
}

struct QuicSink {
    connection: Connection,
    send: SendStream,
}

#[async_trait]
impl MessageSink for QuicSink {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');

        self.send
            .write_all(&data)
            .await
            .map_err(|e| LinkError::NetworkError(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.send.finish().await;
        self.connection.close(0u32.into(), b"link closed");
        debug!("QUIC link connection closed");
    }
}

struct QuicStream {
    lines: Lines<BufReader<RecvStream>>,
}

#[async_trait]
impl MessageStream for QuicStream {
    async fn next_line(&mut self) -> Option<Result<String>> {
        match self.lines.next_line().await {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => None,
            Err(e) => Some(Err(LinkError::NetworkError(e.to_string()))),
        }
    }
}

// 跳过服务器证书验证（采集端证书为启动时生成的自签名证书）
struct SkipServerVerification;

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
