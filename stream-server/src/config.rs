use crate::hub::HubConfig;
use anyhow::{Context, Result};
use common::serde_helpers::duration_ms;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// 环境变量前缀
const ENV_PREFIX: &str = "TELEMETRY_";

/// 采集端配置
///
/// 优先级：内置默认值 < TOML 文件 < `TELEMETRY_*` 环境变量 < 命令行参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    /// 节点标识，与会话ID一起组成 MatchId
    pub node_id: String,
    pub quic_host: String,
    pub quic_port: u16,
    pub http_host: String,
    pub http_port: u16,
    /// 设置后 `/api/*` 需要携带令牌
    pub access_token: Option<String>,
    pub capture_dir: PathBuf,
    /// 采集文件保留时长
    #[serde(with = "duration_ms")]
    pub capture_retention: Duration,
    /// 采集目录总大小上限（字节）
    pub capture_max_size: u64,
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
    pub record_limit_per_match: usize,
    #[serde(with = "duration_ms")]
    pub ws_ping_interval: Duration,
    #[serde(with = "duration_ms")]
    pub ws_read_timeout: Duration,
    pub hub: HubConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            node_id: "node-1".to_string(),
            quic_host: "0.0.0.0".to_string(),
            quic_port: 8443,
            http_host: "0.0.0.0".to_string(),
            http_port: 8080,
            access_token: None,
            capture_dir: PathBuf::from("./data/captures"),
            capture_retention: Duration::from_secs(7 * 24 * 3600),
            capture_max_size: 10 * 1024 * 1024 * 1024,
            cleanup_interval: Duration::from_secs(300),
            record_limit_per_match: 100_000,
            ws_ping_interval: Duration::from_secs(54),
            ws_read_timeout: Duration::from_secs(60),
            hub: HubConfig::default(),
        }
    }
}

impl Config {
    /// 加载配置；`path` 为空时只使用默认值和环境变量
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {:?}", path))?;
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// 按键名覆盖配置项，键名不含前缀
    pub fn apply_overrides<F>(&mut self, get: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = get("LOG_LEVEL") {
            self.log_level = value;
        }
        if let Some(value) = get("NODE_ID") {
            self.node_id = value;
        }
        if let Some(value) = get("QUIC_HOST") {
            self.quic_host = value;
        }
        if let Some(value) = get("QUIC_PORT") {
            self.quic_port = parse_value("QUIC_PORT", &value)?;
        }
        if let Some(value) = get("HTTP_HOST") {
            self.http_host = value;
        }
        if let Some(value) = get("HTTP_PORT") {
            self.http_port = parse_value("HTTP_PORT", &value)?;
        }
        if let Some(value) = get("ACCESS_TOKEN") {
            self.access_token = (!value.is_empty()).then_some(value);
        }
        if let Some(value) = get("CAPTURE_DIR") {
            self.capture_dir = PathBuf::from(value);
        }
        if let Some(value) = get("RING_CAPACITY") {
            self.hub.ring_capacity = parse_value("RING_CAPACITY", &value)?;
        }
        if let Some(value) = get("MAX_FRAME_RATE") {
            self.hub.max_frame_rate = parse_value("MAX_FRAME_RATE", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            anyhow::bail!("node_id must not be empty");
        }
        if self.hub.ring_capacity == 0 {
            anyhow::bail!("hub.ring_capacity must be greater than zero");
        }
        if self.hub.max_frame_rate == 0 {
            anyhow::bail!("hub.max_frame_rate must be greater than zero");
        }
        if self.hub.subscriber_queue == 0 {
            anyhow::bail!("hub.subscriber_queue must be greater than zero");
        }
        if self.hub.default_frame_rate == 0 || self.hub.default_frame_rate > self.hub.max_frame_rate {
            anyhow::bail!("hub.default_frame_rate must be between 1 and hub.max_frame_rate");
        }
        // 定时任务的周期不能为零
        if self.hub.maintenance_interval.is_zero() {
            anyhow::bail!("hub.maintenance_interval must be greater than zero");
        }
        if self.cleanup_interval.is_zero() {
            anyhow::bail!("cleanup_interval must be greater than zero");
        }
        if self.ws_ping_interval.is_zero() {
            anyhow::bail!("ws_ping_interval must be greater than zero");
        }
        if self.ws_ping_interval >= self.ws_read_timeout {
            anyhow::bail!(
                "ws_ping_interval ({:?}) must be shorter than ws_read_timeout ({:?})",
                self.ws_ping_interval,
                self.ws_read_timeout
            );
        }
        Ok(())
    }

    pub fn quic_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.quic_host, self.quic_port)
            .parse()
            .with_context(|| format!("Invalid QUIC address {}:{}", self.quic_host, self.quic_port))
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.http_host, self.http_port)
            .parse()
            .with_context(|| format!("Invalid HTTP address {}:{}", self.http_host, self.http_port))
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value for {}{}: {} ({})", ENV_PREFIX, key, value, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.quic_port, 8443);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.hub.ring_capacity, 10_000);
        assert_eq!(config.hub.max_frame_rate, 60);
        assert_eq!(config.ws_ping_interval, Duration::from_secs(54));
        assert!(config.access_token.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(
            &path,
            r#"
node_id = "eu-west"
http_port = 9090
access_token = "secret"
capture_retention = 60000

[hub]
ring_capacity = 500
match_idle_timeout = 15000
"#,
        )
        .unwrap();

        let config = Config::load(Some(path.as_path())).unwrap();
        assert_eq!(config.node_id, "eu-west");
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.access_token.as_deref(), Some("secret"));
        assert_eq!(config.capture_retention, Duration::from_secs(60));
        assert_eq!(config.hub.ring_capacity, 500);
        assert_eq!(config.hub.match_idle_timeout, Duration::from_secs(15));
        // 未配置的项保持默认值
        assert_eq!(config.hub.default_frame_rate, 30);
    }

    #[test]
    fn test_overrides() {
        let values: HashMap<&str, String> = [
            ("HTTP_PORT", "7000".to_string()),
            ("NODE_ID", "local".to_string()),
            ("ACCESS_TOKEN", "abc".to_string()),
            ("MAX_FRAME_RATE", "120".to_string()),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| values.get(key).cloned()).unwrap();

        assert_eq!(config.http_port, 7000);
        assert_eq!(config.node_id, "local");
        assert_eq!(config.access_token.as_deref(), Some("abc"));
        assert_eq!(config.hub.max_frame_rate, 120);
        assert_eq!(config.http_addr().unwrap().port(), 7000);
    }

    #[test]
    fn test_invalid_override() {
        let mut config = Config::default();
        let result = config.apply_overrides(|key| (key == "QUIC_PORT").then(|| "high".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_node_id() {
        let config = Config {
            node_id: "  ".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = Config::default();
        config.hub.maintenance_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let config = Config {
            cleanup_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            ws_ping_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_ping_shorter_than_read_timeout() {
        let config = Config {
            ws_ping_interval: Duration::from_secs(60),
            ws_read_timeout: Duration::from_secs(60),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            ws_ping_interval: Duration::from_secs(5),
            ws_read_timeout: Duration::from_secs(10),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_default_frame_rate() {
        let mut config = Config::default();
        config.hub.default_frame_rate = 0;
        assert!(config.validate().is_err());

        config.hub.default_frame_rate = config.hub.max_frame_rate + 1;
        assert!(config.validate().is_err());
    }
}
