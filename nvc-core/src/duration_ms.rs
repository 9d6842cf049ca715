//! Serde helpers storing `Duration` values as integer milliseconds
//!
//! Use with `#[serde(with = "nvc_core::duration_ms")]`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serialize a duration as whole milliseconds
pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis().min(u64::MAX as u128) as u64)
}

/// Deserialize a duration from whole milliseconds
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timeouts {
        #[serde(with = "crate::duration_ms")]
        connect: Duration,
    }

    #[test]
    fn test_duration_as_millis() {
        let json = serde_json::to_string(&Timeouts {
            connect: Duration::from_secs(10),
        })
        .unwrap();
        assert_eq!(json, r#"{"connect":10000}"#);

        let parsed: Timeouts = serde_json::from_str(r#"{"connect":250}"#).unwrap();
        assert_eq!(parsed.connect, Duration::from_millis(250));
    }
}
