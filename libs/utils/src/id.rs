use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{de::Visitor, Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("invalid id length {0}, expected 16 hex digits")]
    SliceParseError(usize),
    #[error("{0}")]
    HexParseError(#[from] hex::FromHexError),
}

/// Identifier of a single environment instance: a random 64-bit value,
/// rendered as 16 hex digits. The id doubles as the port-allocation
/// release key and the name of the instance's temp directory, so it must
/// be filesystem- and URL-safe.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvironmentId([u8; 8]);

impl EnvironmentId {
    pub fn generate() -> Self {
        let mut buf = [0u8; 8];
        rand::thread_rng().fill(&mut buf);
        EnvironmentId(buf)
    }

    pub const fn from_array(b: [u8; 8]) -> Self {
        EnvironmentId(b)
    }
}

impl FromStr for EnvironmentId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err(IdError::SliceParseError(s.len()));
        }
        let mut buf = [0u8; 8];
        hex::decode_to_slice(s, &mut buf)?;
        Ok(EnvironmentId(buf))
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for EnvironmentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EnvironmentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = EnvironmentId;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a 16 hex digit environment id")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_str(IdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let id = EnvironmentId::generate();
        let s = id.to_string();
        assert_eq!(s.len(), 16);
        assert_eq!(s.parse::<EnvironmentId>().unwrap(), id);
    }

    #[test]
    fn serde_as_string() {
        let id = EnvironmentId::from_array([0, 1, 2, 3, 4, 5, 6, 7]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"0001020304050607\"");
        assert_eq!(serde_json::from_str::<EnvironmentId>(&json).unwrap(), id);
    }

    #[test]
    fn rejects_bad_input() {
        assert!("zz01020304050607".parse::<EnvironmentId>().is_err());
        assert!("0badc0ffee".parse::<EnvironmentId>().is_err());
    }
}
