use crate::error::{Result, TelemetryError};
use crate::types::Frame;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 采集端 -> 订阅者 消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Frame { payload: Frame },
    Subscribed {
        match_id: String,
        frame_count: usize,
        is_live: bool,
    },
    MatchEnded,
    StreamEnded,
    Error { error: String },
}

#[derive(Serialize)]
struct BorrowedFrameMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    payload: &'a Frame,
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 直接序列化帧消息，避免为每次广播克隆帧
    pub fn frame_json(frame: &Frame) -> Result<String> {
        Ok(serde_json::to_string(&BorrowedFrameMessage {
            kind: "frame",
            payload: frame,
        })?)
    }
}

/// 订阅者 -> 采集端 消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Control(ControlRequest),
    Seek(SeekRequest),
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// 播放控制命令
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    Play,
    Pause,
    Framerate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub command: ControlCommand,
    #[serde(default)]
    pub framerate: i64,
}

/// 定位请求：按帧序号或按 "MM:SS" / "HH:MM:SS" 时间
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeekRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

/// 解析 "MM:SS" 或 "HH:MM:SS" 为相对比赛开始的偏移
pub fn parse_seek_time(value: &str) -> Result<Duration> {
    let parts = value
        .trim()
        .split(':')
        .map(|part| part.parse::<u64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| TelemetryError::InvalidSeekTime(value.to_string()))?;

    let seconds = match parts.as_slice() {
        [minutes, seconds] if *seconds < 60 => minutes
            .checked_mul(60)
            .and_then(|total| total.checked_add(*seconds)),
        [hours, minutes, seconds] if *minutes < 60 && *seconds < 60 => hours
            .checked_mul(3600)
            .and_then(|total| total.checked_add(minutes * 60 + seconds)),
        _ => None,
    };

    seconds
        .map(Duration::from_secs)
        .ok_or_else(|| TelemetryError::InvalidSeekTime(value.to_string()))
}

/// 采集端对每条入站封装的确认
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestAck {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Value};

    #[test]
    fn test_server_message_tags() {
        let subscribed = ServerMessage::Subscribed {
            match_id: "m".to_string(),
            frame_count: 3,
            is_live: true,
        };
        let value: Value = serde_json::from_str(&subscribed.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "subscribed", "match_id": "m", "frame_count": 3, "is_live": true})
        );

        assert_eq!(ServerMessage::MatchEnded.to_json().unwrap(), r#"{"type":"match_ended"}"#);
        assert_eq!(ServerMessage::StreamEnded.to_json().unwrap(), r#"{"type":"stream_ended"}"#);
        assert_eq!(
            ServerMessage::Error { error: "boom".to_string() }.to_json().unwrap(),
            r#"{"type":"error","error":"boom"}"#
        );
    }

    #[test]
    fn test_frame_json_matches_owned_variant() {
        let frame = Frame::new(7, Utc::now(), json!({"clock": 12.5}));
        let borrowed = ServerMessage::frame_json(&frame).unwrap();
        let owned = ServerMessage::Frame { payload: frame }.to_json().unwrap();
        assert_eq!(borrowed, owned);
    }

    #[test]
    fn test_client_message_decoding() {
        let control = ClientMessage::parse(
            r#"{"type":"control","payload":{"command":"framerate","framerate":15}}"#,
        )
        .unwrap();
        assert_eq!(
            control,
            ClientMessage::Control(ControlRequest {
                command: ControlCommand::Framerate,
                framerate: 15
            })
        );

        let pause = ClientMessage::parse(r#"{"type":"control","payload":{"command":"pause"}}"#).unwrap();
        assert!(matches!(
            pause,
            ClientMessage::Control(ControlRequest { command: ControlCommand::Pause, .. })
        ));

        let seek = ClientMessage::parse(r#"{"type":"seek","payload":{"frame":12}}"#).unwrap();
        assert_eq!(seek, ClientMessage::Seek(SeekRequest { frame: Some(12), time: None }));

        assert!(ClientMessage::parse(r#"{"type":"rewind","payload":{}}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn test_parse_seek_time() {
        assert_eq!(parse_seek_time("01:30").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_seek_time("1:02:03").unwrap(), Duration::from_secs(3723));
        assert!(parse_seek_time("1:75").is_err());
        assert!(parse_seek_time("abc").is_err());
        assert!(parse_seek_time("1").is_err());
    }

    #[test]
    fn test_parse_seek_time_overflow() {
        assert!(parse_seek_time("5124095576030432:00:00").is_err());
        assert!(parse_seek_time("18446744073709551615:00").is_err());
        assert_eq!(
            parse_seek_time("9999999999:00:00").unwrap(),
            Duration::from_secs(9_999_999_999 * 3600)
        );
    }

    #[test]
    fn test_ingest_ack() {
        assert_eq!(serde_json::to_string(&IngestAck::ok()).unwrap(), r#"{"success":true}"#);
        let failed: IngestAck =
            serde_json::from_str(r#"{"success":false,"error":"bad frame"}"#).unwrap();
        assert_eq!(failed, IngestAck::failed("bad frame"));
    }
}
