//! Byte-size type accepting plain numbers or `"256MB"`-style strings.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const fn from_bytes(bytes: u64) -> ByteSize {
        ByteSize(bytes)
    }

    pub const fn from_mib(mib: u64) -> ByteSize {
        ByteSize(mib * 1024 * 1024)
    }

    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn parse_byte_size(s: &str) -> Result<ByteSize, String> {
    let s = s.trim();
    if let Ok(bytes) = s.parse::<u64>() {
        return Ok(ByteSize(bytes));
    }
    let upper = s.to_uppercase();
    let (num, multiplier) = if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024u64)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix('B') {
        (n, 1)
    } else {
        return Err(format!(
            "invalid byte size '{s}': expected a number or a B/KB/MB/GB suffix"
        ));
    };
    let num: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid number in byte size '{s}'"))?;
    Ok(ByteSize(num * multiplier))
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl de::Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte size like 1048576, \"64KB\", \"256MB\", \"1GB\"")
            }

            fn visit_u64<E>(self, v: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<ByteSize, E>
            where
                E: de::Error,
            {
                if v < 0 {
                    return Err(E::custom("byte size cannot be negative"));
                }
                Ok(ByteSize(v as u64))
            }

            fn visit_str<E>(self, s: &str) -> Result<ByteSize, E>
            where
                E: de::Error,
            {
                parse_byte_size(s).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

impl Serialize for ByteSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("1024").unwrap(), ByteSize(1024));
        assert_eq!(parse_byte_size("64KB").unwrap(), ByteSize(64 * 1024));
        assert_eq!(parse_byte_size("256MB").unwrap(), ByteSize::from_mib(256));
        assert_eq!(parse_byte_size("1GB").unwrap(), ByteSize(1 << 30));
        assert_eq!(parse_byte_size("512B").unwrap(), ByteSize(512));
        assert_eq!(parse_byte_size("64kb").unwrap(), ByteSize(64 * 1024));
        assert!(parse_byte_size("64XB").is_err());
    }
}
