use common::TelemetryError;
use thiserror::Error;

/// 帧链路错误
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Link is closed")]
    Closed,

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Spill queue IO error: {0}")]
    Spill(#[from] std::io::Error),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}

impl LinkError {
    /// 网络类错误只驱动重连，不向上抛出
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LinkError::ConnectionFailed(_)
                | LinkError::NetworkError(_)
                | LinkError::Timeout
                | LinkError::NotConnected
        )
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LinkError::Timeout.is_transient());
        assert!(LinkError::NetworkError("reset".to_string()).is_transient());
        assert!(!LinkError::QueueFull.is_transient());
        assert!(!LinkError::Closed.is_transient());
    }
}
