use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// 以毫秒读写 `Duration`，用于 TOML 配置
pub mod duration_ms {
    use super::*;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timeouts {
        #[serde(with = "duration_ms")]
        dial: Duration,
    }

    #[test]
    fn test_duration_as_millis() {
        let json = serde_json::to_string(&Timeouts { dial: Duration::from_secs(3) }).unwrap();
        assert_eq!(json, r#"{"dial":3000}"#);

        let parsed: Timeouts = serde_json::from_str(r#"{"dial":250}"#).unwrap();
        assert_eq!(parsed.dial, Duration::from_millis(250));
    }
}
