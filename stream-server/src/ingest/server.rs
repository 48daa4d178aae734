use super::IngestPipeline;
use crate::error::{Result, StreamError};
use quinn::{Connection, Endpoint, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// QUIC 入站服务器
pub struct IngestServer {
    endpoint: Endpoint,
    pipeline: IngestPipeline,
}

impl IngestServer {
    pub fn new(addr: SocketAddr, pipeline: IngestPipeline) -> Result<Self> {
        // 创建自签名证书
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| StreamError::NetworkError(e.to_string()))?;

        let cert_der = cert
            .serialize_der()
            .map_err(|e| StreamError::NetworkError(e.to_string()))?;
        let key_der = cert.serialize_private_key_der();

        let cert_chain = vec![rustls::Certificate(cert_der)];
        let key = rustls::PrivateKey(key_der);

        let mut server_config = ServerConfig::with_single_cert(cert_chain, key)
            .map_err(|e| StreamError::NetworkError(e.to_string()))?;

        // 配置传输参数
        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_concurrent_uni_streams(0_u32.into());
        transport_config.max_concurrent_bidi_streams(4_u32.into());
        transport_config.max_idle_timeout(Duration::from_secs(120).try_into().ok());
        server_config.transport_config(Arc::new(transport_config));

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| StreamError::NetworkError(e.to_string()))?;

        Ok(Self { endpoint, pipeline })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("Ingest server running on {}", self.local_addr()?);

        loop {
            let connecting = tokio::select! {
                _ = cancel.cancelled() => break,
                connecting = self.endpoint.accept() => match connecting {
                    Some(connecting) => connecting,
                    None => break,
                },
            };

            let pipeline = self.pipeline.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                match connecting.await {
                    Ok(connection) => {
                        info!("New producer connection from: {}", connection.remote_address());
                        handle_connection(connection, pipeline, cancel).await;
                    }
                    Err(e) => {
                        error!("Connection failed: {}", e);
                    }
                }
            });
        }

        self.endpoint.close(0u32.into(), b"server shutdown");
        info!("Ingest server stopped");
        Ok(())
    }
}

async fn handle_connection(connection: Connection, pipeline: IngestPipeline, cancel: CancellationToken) {
    let remote = connection.remote_address();

    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            stream = connection.accept_bi() => stream,
        };

        match stream {
            Ok((send, recv)) => {
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    match pipeline.serve(recv, send).await {
                        Ok(count) => debug!("Producer stream from {} closed after {} messages", remote, count),
                        Err(e) => warn!("Producer stream from {} failed: {}", remote, e),
                    }
                });
            }
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => {
                info!("Producer {} disconnected", remote);
                break;
            }
            Err(e) => {
                warn!("Producer connection {} lost: {}", remote, e);
                break;
            }
        }
    }
}
