use crate::link::LinkConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// 环境变量前缀
const ENV_PREFIX: &str = "TELEMETRY_";

/// 生产端配置
///
/// 优先级：内置默认值 < TOML 文件 < `TELEMETRY_*` 环境变量 < 命令行参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub collector_host: String,
    pub collector_port: u16,
    /// TLS 服务器名称
    pub server_name: String,
    /// 每秒产生的帧数
    pub frequency: u32,
    /// 比赛会话ID，未配置时启动时随机生成
    pub session_id: Option<Uuid>,
    pub link: LinkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            collector_host: "127.0.0.1".to_string(),
            collector_port: 8443,
            server_name: "localhost".to_string(),
            frequency: 30,
            session_id: None,
            link: LinkConfig::default(),
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
        if let Some(value) = get("COLLECTOR_HOST") {
            self.collector_host = value;
        }
        if let Some(value) = get("COLLECTOR_PORT") {
            self.collector_port = parse_value("COLLECTOR_PORT", &value)?;
        }
        if let Some(value) = get("SERVER_NAME") {
            self.server_name = value;
        }
        if let Some(value) = get("FREQUENCY") {
            self.frequency = parse_value("FREQUENCY", &value)?;
        }
        if let Some(value) = get("SESSION_ID") {
            self.session_id = Some(parse_value("SESSION_ID", &value)?);
        }
        if let Some(value) = get("QUEUE_CAPACITY") {
            self.link.queue_capacity = parse_value("QUEUE_CAPACITY", &value)?;
        }
        if let Some(value) = get("SPILL_DIR") {
            self.link.spill_dir = PathBuf::from(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.frequency == 0 {
            anyhow::bail!("frequency must be greater than zero");
        }
        if self.link.queue_capacity == 0 {
            anyhow::bail!("link.queue_capacity must be greater than zero");
        }
        if self.link.reconnect_multiplier < 1.0 {
            anyhow::bail!("link.reconnect_multiplier must be at least 1.0");
        }
        if self.link.ping_interval.is_zero() {
            anyhow::bail!("link.ping_interval must be greater than zero");
        }
        if self.link.write_timeout.is_zero() || self.link.dial_timeout.is_zero() {
            anyhow::bail!("link.write_timeout and link.dial_timeout must be greater than zero");
        }
        if self.link.initial_reconnect_delay > self.link.max_reconnect_delay {
            anyhow::bail!("link.initial_reconnect_delay must not exceed link.max_reconnect_delay");
        }
        Ok(())
    }

    /// 解析采集端地址
    pub fn collector_addr(&self) -> Result<SocketAddr> {
        (self.collector_host.as_str(), self.collector_port)
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve {}:{}", self.collector_host, self.collector_port))?
            .next()
            .with_context(|| format!("No address for {}:{}", self.collector_host, self.collector_port))
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
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.frequency, 30);
        assert_eq!(config.link.queue_capacity, 1000);
        assert_eq!(config.link.disk_buffer_threshold, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            r#"
collector_host = "10.0.0.5"
frequency = 10

[link]
queue_capacity = 50
disk_buffer_threshold = 1500
"#,
        )
        .unwrap();

        let config = Config::load(Some(path.as_path())).unwrap();
        assert_eq!(config.collector_host, "10.0.0.5");
        assert_eq!(config.frequency, 10);
        assert_eq!(config.link.queue_capacity, 50);
        assert_eq!(config.link.disk_buffer_threshold, Duration::from_millis(1500));
        // 未配置的项保持默认值
        assert_eq!(config.link.catch_up_batch_size, 100);
    }

    #[test]
    fn test_overrides() {
        let session = Uuid::new_v4();
        let values: HashMap<&str, String> = [
            ("COLLECTOR_PORT", "9000".to_string()),
            ("SESSION_ID", session.to_string()),
            ("SPILL_DIR", "/var/spill".to_string()),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| values.get(key).cloned()).unwrap();

        assert_eq!(config.collector_port, 9000);
        assert_eq!(config.session_id, Some(session));
        assert_eq!(config.link.spill_dir, PathBuf::from("/var/spill"));
    }

    #[test]
    fn test_invalid_override() {
        let mut config = Config::default();
        let result = config.apply_overrides(|key| (key == "FREQUENCY").then(|| "fast".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_frequency() {
        let config = Config {
            frequency: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_link_intervals() {
        let mut config = Config::default();
        config.link.ping_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.link.write_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.link.dial_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_reconnect_delays() {
        let mut config = Config::default();
        config.link.initial_reconnect_delay = Duration::from_secs(10);
        config.link.max_reconnect_delay = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }
}
