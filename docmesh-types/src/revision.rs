//! Revisions, revision histories and change-feed sequences.

use crate::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A document revision: `{generation}-{hash}`.
///
/// Revisions of one document form a tree. The generation is the depth in
/// that tree; the hash distinguishes siblings created concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    generation: u64,
    hash: String,
}

impl Revision {
    /// Creates a revision from its parts.
    pub fn new(generation: u64, hash: impl Into<String>) -> Self {
        Self {
            generation,
            hash: hash.into(),
        }
    }

    /// Depth of this revision in the document's revision tree (starts at 1).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The hash part of the revision.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for Revision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, hash) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidRevision(s.to_string()))?;
        let generation: u64 = generation
            .parse()
            .map_err(|_| Error::InvalidRevision(s.to_string()))?;
        if hash.is_empty() {
            return Err(Error::InvalidRevision(s.to_string()));
        }
        Ok(Self::new(generation, hash))
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Compact ancestry of a revision, newest first: `start` is the
/// generation of `ids[0]`, and each following id is one generation older.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionHistory {
    pub start: u64,
    pub ids: Vec<String>,
}

impl RevisionHistory {
    /// Builds a history from a chain of revisions ordered newest first.
    ///
    /// The chain must be contiguous (each entry one generation below the
    /// previous one); an empty chain yields `None`.
    pub fn from_chain(chain: &[Revision]) -> Option<Self> {
        let first = chain.first()?;
        Some(Self {
            start: first.generation(),
            ids: chain.iter().map(|r| r.hash().to_string()).collect(),
        })
    }

    /// Expands the history back into full revisions, newest first.
    #[must_use]
    pub fn revisions(&self) -> Vec<Revision> {
        self.ids
            .iter()
            .enumerate()
            .filter_map(|(i, hash)| {
                let generation = self.start.checked_sub(i as u64)?;
                (generation > 0).then(|| Revision::new(generation, hash.clone()))
            })
            .collect()
    }
}

/// Opaque position in a replica's change feed.
///
/// Servers report sequences either as JSON numbers or as strings with a
/// numeric prefix (`"42-g1AAAA..."`). Ordering uses that prefix. The empty
/// sequence means "from the beginning".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Seq(String);

impl Seq {
    /// The start of the feed.
    #[must_use]
    pub fn start() -> Self {
        Self(String::new())
    }

    /// Wraps a raw sequence value.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Whether this cursor points at the start of the feed.
    #[must_use]
    pub fn is_start(&self) -> bool {
        self.0.is_empty() || self.0 == "0"
    }

    /// The raw sequence value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The numeric prefix used for ordering; `0` when there is none.
    #[must_use]
    pub fn ordinal(&self) -> u64 {
        let prefix = self.0.split('-').next().unwrap_or_default();
        prefix.parse().unwrap_or(0)
    }
}

impl From<u64> for Seq {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl Ord for Seq {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordinal()
            .cmp(&other.ordinal())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Seq {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Seq {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Seq {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Self(n.to_string()),
            Raw::Text(s) => Self(s),
        })
    }
}
