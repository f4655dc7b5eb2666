//! Collision-free resource names.
//!
//! Every volume, snapshot and node name the harness hands to a plugin is
//! `prefix-SUFFIX`, where the suffix is drawn once per session from the OS
//! random source. Repeated runs against shared infrastructure therefore do
//! not collide, while names within one run stay stable.

use rand::RngCore;
use rand::rngs::OsRng;

/// Number of random bytes behind a suffix.
const SUFFIX_BYTES: usize = 8;

/// Random suffix shared by every name generated in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueSuffix(String);

impl UniqueSuffix {
    /// Draw a new suffix from the OS random source.
    ///
    /// The suffix is two 8-digit upper-case hex groups joined by a hyphen.
    /// If the random source fails the suffix is empty and names degrade
    /// to their bare prefix.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SUFFIX_BYTES];
        match OsRng.try_fill_bytes(&mut bytes) {
            Ok(()) => Self::from_bytes(&bytes),
            Err(e) => {
                tracing::warn!(error = %e, "random source unavailable, names carry no suffix");
                Self(String::new())
            }
        }
    }

    fn from_bytes(bytes: &[u8; SUFFIX_BYTES]) -> Self {
        let (high, low) = bytes.split_at(SUFFIX_BYTES / 2);
        Self(format!(
            "{}-{}",
            hex::encode_upper(high),
            hex::encode_upper(low)
        ))
    }

    /// The raw suffix, possibly empty.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Derive a name from `prefix` and this suffix.
    pub fn unique_string(&self, prefix: &str) -> String {
        if self.0.is_empty() {
            prefix.to_string()
        } else {
            format!("{}-{}", prefix, self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_format() {
        let suffix = UniqueSuffix::generate();
        let s = suffix.as_str();
        assert_eq!(s.len(), 17);
        let groups: Vec<&str> = s.split('-').collect();
        assert_eq!(groups.len(), 2);
        for group in groups {
            assert_eq!(group.len(), 8);
            assert!(
                group
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
            );
        }
    }

    #[test]
    fn test_from_bytes() {
        let suffix = UniqueSuffix::from_bytes(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01, 0x02, 0x0a]);
        assert_eq!(suffix.as_str(), "DEADBEEF-0001020A");
    }

    #[test]
    fn test_unique_string_is_stable() {
        let suffix = UniqueSuffix::generate();
        let first = suffix.unique_string("vol");
        let second = suffix.unique_string("vol");
        assert_eq!(first, second);
        assert!(first.starts_with("vol-"));
        assert_eq!(first, format!("vol-{}", suffix.as_str()));
    }

    #[test]
    fn test_independent_suffixes_differ() {
        let a = UniqueSuffix::generate();
        let b = UniqueSuffix::generate();
        assert_ne!(a.unique_string("vol"), b.unique_string("vol"));
    }

    #[test]
    fn test_empty_suffix_keeps_prefix() {
        let suffix = UniqueSuffix(String::new());
        assert!(suffix.is_empty());
        assert_eq!(suffix.unique_string("snapshot"), "snapshot");
    }
}
