use crate::error::{Result, TelemetryError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 遥测帧
///
/// 一场比赛中的最小遥测单元。`frame_index` 在同一比赛内单调递增，
/// 创建后不再修改；广播后以只读方式共享。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub frame_index: u32,
    pub timestamp: DateTime<Utc>,
    /// 比赛会话ID，采集端据此推导 MatchId
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    /// 不透明负载
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl Frame {
    pub fn new(frame_index: u32, timestamp: DateTime<Utc>, payload: Value) -> Self {
        Self {
            frame_index,
            timestamp,
            session_id: None,
            payload,
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// 线路封装
///
/// 每条线路消息恰好携带一个 `Frame`；不带帧的空封装 `{}` 用作保活。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<Frame>,
}

impl Envelope {
    pub fn new(frame: Frame) -> Self {
        Self { frame: Some(frame) }
    }

    pub fn keepalive() -> Self {
        Self { frame: None }
    }

    /// 序列化为单行JSON（不含换行符）
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

/// 比赛标识：会话UUID + 采集节点名，字符串形式为 `<uuid>.<node>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchId {
    pub uuid: Uuid,
    pub node: String,
}

impl MatchId {
    pub fn new(uuid: Uuid, node: impl Into<String>) -> Result<Self> {
        let node = node.into();
        if uuid.is_nil() {
            return Err(TelemetryError::InvalidMatchId("nil uuid".to_string()));
        }
        if node.is_empty() {
            return Err(TelemetryError::InvalidMatchId("empty node".to_string()));
        }
        Ok(Self { uuid, node })
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.uuid, self.node)
    }
}

impl FromStr for MatchId {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        let (uuid, node) = s
            .split_once('.')
            .ok_or_else(|| TelemetryError::InvalidMatchId(s.to_string()))?;
        let uuid = Uuid::parse_str(uuid).map_err(|_| TelemetryError::InvalidMatchId(s.to_string()))?;
        MatchId::new(uuid, node)
    }
}

impl Serialize for MatchId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MatchId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// 链路连接状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

/// 链路缓冲模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferMode {
    Memory = 0,
    Disk = 1,
}
