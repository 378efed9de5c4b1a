//! Duration type with human-readable parsing support.
//!
//! Supports parsing from:
//! - Numbers (interpreted as milliseconds): `5000`
//! - Strings with suffixes: `"5us"`, `"5ms"`, `"0.1ms"`, `"5s"`, `"5m"`, `"5h"`, `"5d"`
//!
//! Internally stores microseconds to support sub-millisecond precision.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Duration in microseconds with human-readable parsing support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Duration(pub u64);

impl Duration {
    pub const fn from_micros(us: u64) -> Self {
        Duration(us)
    }

    pub const fn from_millis(ms: u64) -> Self {
        Duration(ms * 1000)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs * 1_000_000)
    }

    pub const fn from_mins(mins: u64) -> Self {
        Duration(mins * 60 * 1_000_000)
    }

    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    pub const fn as_millis(&self) -> u64 {
        self.0 / 1000
    }

    pub const fn as_secs(&self) -> u64 {
        self.0 / 1_000_000
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Converts to std::time::Duration.
    pub const fn as_std(&self) -> std::time::Duration {
        std::time::Duration::from_micros(self.0)
    }

    /// Timeouts below one millisecond are treated as disabled; the session
    /// idle timeout is the one exception and keeps sub-ms values.
    pub fn rounded_for_timeout(&self) -> Option<std::time::Duration> {
        if self.as_millis() == 0 {
            None
        } else {
            Some(self.as_std())
        }
    }
}

impl From<u64> for Duration {
    /// Creates Duration from milliseconds.
    fn from(ms: u64) -> Self {
        Duration(ms * 1000)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        std::time::Duration::from_micros(d.0)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl de::Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(
                    "a duration like '5s', '100ms', '0.1ms', '100us', '1h', '30m', '1d' or a number in milliseconds",
                )
            }

            fn visit_u64<E>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration(v * 1000))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                if v < 0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(Duration(v as u64 * 1000))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                if v < 0.0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(Duration((v * 1000.0) as u64))
            }

            fn visit_str<E>(self, s: &str) -> Result<Duration, E>
            where
                E: de::Error,
            {
                parse_duration(s).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

impl Serialize for Duration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.0 / 1000)
    }
}

/// Parse a duration string into a Duration (stored in microseconds).
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if let Ok(ms) = s.parse::<u64>() {
        return Ok(Duration(ms * 1000));
    }

    if let Ok(ms) = s.parse::<f64>() {
        if ms < 0.0 {
            return Err("duration cannot be negative".to_string());
        }
        return Ok(Duration((ms * 1000.0) as u64));
    }

    let s_lower = s.to_lowercase();

    // Multipliers are in microseconds.
    let (num_str, multiplier) = if s_lower.ends_with("us") {
        (&s[..s.len() - 2], 1u64)
    } else if s_lower.ends_with("ms") {
        (&s[..s.len() - 2], 1000u64)
    } else if s_lower.ends_with('s') {
        (&s[..s.len() - 1], 1_000_000u64)
    } else if s_lower.ends_with('m') {
        (&s[..s.len() - 1], 60 * 1_000_000u64)
    } else if s_lower.ends_with('h') {
        (&s[..s.len() - 1], 60 * 60 * 1_000_000u64)
    } else if s_lower.ends_with('d') {
        (&s[..s.len() - 1], 24 * 60 * 60 * 1_000_000u64)
    } else {
        return Err(format!(
            "invalid duration format: '{s}'. Expected a number or a string with suffix (us, ms, s, m, h, d)"
        ));
    };

    let num_str = num_str.trim();

    if let Ok(num) = num_str.parse::<u64>() {
        return Ok(Duration(num * multiplier));
    }

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration: '{num_str}'"))?;

    if num < 0.0 {
        return Err("duration cannot be negative".to_string());
    }

    Ok(Duration((num * multiplier as f64) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_numbers_are_milliseconds() {
        assert_eq!(parse_duration("0").unwrap(), Duration(0));
        assert_eq!(parse_duration("100").unwrap(), Duration(100_000));
        assert_eq!(parse_duration("5000").unwrap(), Duration(5_000_000));
    }

    #[test]
    fn test_parse_suffixes() {
        assert_eq!(parse_duration("100us").unwrap(), Duration(100));
        assert_eq!(parse_duration("5ms").unwrap(), Duration(5_000));
        assert_eq!(parse_duration("0.1ms").unwrap(), Duration(100));
        assert_eq!(parse_duration("5s").unwrap(), Duration(5_000_000));
        assert_eq!(parse_duration("5m").unwrap(), Duration(300_000_000));
        assert_eq!(parse_duration("1h").unwrap(), Duration(3_600_000_000));
        assert_eq!(parse_duration("1d").unwrap(), Duration(86_400_000_000));
        assert_eq!(parse_duration("5S").unwrap(), Duration(5_000_000));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn test_rounded_for_timeout() {
        // Sub-millisecond values round to zero, i.e. disabled.
        assert_eq!(Duration(900).rounded_for_timeout(), None);
        assert_eq!(
            Duration(2_000).rounded_for_timeout(),
            Some(std::time::Duration::from_millis(2))
        );
        assert_eq!(Duration(0).rounded_for_timeout(), None);
    }

    #[test]
    fn test_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Config {
            timeout: Duration,
        }

        let config: Config = toml::from_str("timeout = 5000").unwrap();
        assert_eq!(config.timeout, Duration(5_000_000));

        let config: Config = toml::from_str("timeout = \"0.1ms\"").unwrap();
        assert_eq!(config.timeout, Duration(100));
    }

    #[test]
    fn test_serialize_as_milliseconds() {
        let json = serde_json::to_string(&Duration(5_000_000)).unwrap();
        assert_eq!(json, "5000");
    }
}
