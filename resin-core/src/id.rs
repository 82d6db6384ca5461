use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 256-bit content hash that uniquely identifies a record.
///
/// Ids are rendered and serialized as 64 lowercase hex characters, so a
/// record's references read the same in every transport.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id([u8; 32]);

/// Error returned when parsing an id from text.
#[derive(Debug, thiserror::Error)]
#[error("invalid id {input:?}: expected 64 hex characters")]
pub struct ParseIdError {
    input: String,
}

impl Id {
    /// Creates an id from raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Id(bytes)
    }

    /// Returns the id as a byte slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for Id {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseIdError {
            input: s.to_string(),
        })?;
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(ParseIdError {
                input: s.to_string(),
            });
        }
        Ok(Id(bytes))
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdVisitor;

        impl serde::de::Visitor<'_> for IdVisitor {
            type Value = Id;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("64 lowercase hex characters")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(IdVisitor)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_display_is_lowercase_hex() {
        let id = Id::from_bytes([0xab; 32]);
        let s = id.to_string();
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c == 'a' || c == 'b'));
    }

    #[test]
    fn id_display_keeps_byte_order() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0x01;
        bytes[31] = 0xfe;
        let s = Id::from_bytes(bytes).to_string();
        assert!(s.starts_with("01"));
        assert!(s.ends_with("fe"));
    }

    #[test]
    fn id_parse_display_agree() {
        let id = Id::from_bytes(*blake3::hash(b"parse").as_bytes());
        let parsed: Id = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn id_rejects_bad_text() {
        assert!("xyz".parse::<Id>().is_err());
        assert!("AB".repeat(32).parse::<Id>().is_err());
        assert!("ab".repeat(31).parse::<Id>().is_err());
    }

    #[test]
    fn id_serializes_as_text() {
        let id = Id::from_bytes([7; 32]);
        let mut buf = Vec::new();
        ciborium::into_writer(&id, &mut buf).unwrap();
        let value: ciborium::Value = ciborium::from_reader(&buf[..]).unwrap();
        assert_eq!(value.as_text(), Some(id.to_string().as_str()));
        let back: Id = ciborium::from_reader(&buf[..]).unwrap();
        assert_eq!(back, id);
    }
}
