//! Content checksums: opaque, fixed-width identifiers of raw audio bytes.

use std::fmt;

/// A BLAKE3 digest of a content file's stripped (tag-free) byte stream.
///
/// Two content files with the same checksum are interchangeable content
/// sources for the same [`crate::index::FrozenItem`] — any one suffices.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Checksum(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hash a content file's raw byte stream.
    pub fn of(data: &[u8]) -> Self {
        Checksum(*blake3::hash(data).as_bytes())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self)
    }
}

impl serde::Serialize for Checksum {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex_decode(&s).map_err(serde::de::Error::custom)?;
        Ok(Checksum(bytes))
    }
}

fn hex_decode(s: &str) -> Result<[u8; 32], String> {
    if s.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", s.len()));
    }
    let mut out = [0u8; 32];
    for i in 0..32 {
        let byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
            .map_err(|e| format!("invalid hex at byte {i}: {e}"))?;
        out[i] = byte;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_same_checksum() {
        let a = Checksum::of(b"hello world");
        let b = Checksum::of(b"hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn different_bytes_different_checksum() {
        let a = Checksum::of(b"hello world");
        let b = Checksum::of(b"hello worle");
        assert_ne!(a, b);
    }

    #[test]
    fn display_round_trips_through_serde() {
        let c = Checksum::of(b"round trip me");
        let s = serde_json::to_string(&c).unwrap();
        let back: Checksum = serde_json::from_str(&s).unwrap();
        assert_eq!(c, back);
    }
}
