use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Separator fed between hashed components so `["ab", "c"]` and
/// `["a", "bc"]` never collide.
const COMPONENT_SEPARATOR: u8 = 0x1f;

fn hash_components(domain: &str, components: &[&str]) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain.as_bytes());
    for component in components {
        hasher.update(&[COMPONENT_SEPARATOR]);
        hasher.update(component.as_bytes());
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

fn parse_hex_id(s: &str) -> Result<u64, ParseIdError> {
    let trimmed = s.trim();
    let digits = trimmed.strip_prefix('#').unwrap_or(trimmed);
    if digits.is_empty() || digits.len() > 16 {
        return Err(ParseIdError(s.to_string()));
    }
    u64::from_str_radix(digits, 16).map_err(|_| ParseIdError(s.to_string()))
}

/// Returned when a string is not a 1-16 digit hexadecimal identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier: {0:?} (expected up to 16 hex digits)")]
pub struct ParseIdError(String);

/// A stable page identifier derived from the corpus-relative source path.
///
/// The same path always yields the same id, so re-indexing a file replaces
/// its page instead of adding a second copy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PageId(u64);

impl PageId {
    pub fn from_source_path(relative_path: &str) -> Self {
        Self(hash_components("page", &[relative_path]))
    }

    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// The numeric id used as the key in store tables.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Short hex prefix for human display (e.g. "a1b2c3").
    pub fn short(self) -> String {
        self.to_string()[..6].to_string()
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for PageId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex_id(s).map(Self)
    }
}

/// Identifier of a node in the section tree.
///
/// Derived from the whole chain of section names from the root, so two
/// sections with the same name under different parents stay distinct and a
/// parent's id is always computable from a prefix of the child's path.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SectionId(u64);

impl SectionId {
    /// Key reserved for "the root" in parent/child tables. Never produced by
    /// [`SectionId::from_path`].
    pub const ROOT_KEY: u64 = 0;

    pub fn from_path<S: AsRef<str>>(path: &[S]) -> Self {
        let components: Vec<&str> = path.iter().map(AsRef::as_ref).collect();
        let value = hash_components("section", &components);
        Self(value.max(1))
    }

    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Table key for an optional parent, mapping `None` to the root key.
    pub fn key_of(parent: Option<SectionId>) -> u64 {
        parent.map_or(Self::ROOT_KEY, SectionId::get)
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for SectionId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_hex_id(s)? {
            Self::ROOT_KEY => Err(ParseIdError(s.to_string())),
            value => Ok(Self(value)),
        }
    }
}
