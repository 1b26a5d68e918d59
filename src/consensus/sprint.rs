//! Sprint length configuration.
//!
//! A sprint is a run of consecutive heights produced by the same primary. The
//! sprint length may change at configured activation heights; each maximal
//! height range sharing one length is a [`SprintRegime`].
//!
//! Sprint indices are cumulative across regimes: a regime starts counting at
//! the index following the last (possibly partial) sprint of the previous
//! regime, and offsets within a regime are measured from its start height.
//! Rotation therefore never repeats or skips a producer when the length
//! changes.

use serde::{
    de::{MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use std::{collections::BTreeMap, fmt};

/// Errors raised while loading a sprint table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SprintConfigError {
    /// No entries at all.
    #[error("sprint table is empty")]
    Empty,

    /// No entry activates at block 0.
    #[error("sprint table has no entry for block 0")]
    MissingGenesisEntry,

    /// A sprint length of zero.
    #[error("sprint length at block {0} is zero")]
    ZeroLength(u64),

    /// Two keys name the same activation height.
    #[error("duplicate sprint activation height {0}")]
    DuplicateKey(u64),

    /// Key is not a decimal block number.
    #[error("invalid sprint activation height {0:?}")]
    InvalidKey(String),

    /// Sprint index arithmetic overflowed.
    #[error("sprint index overflow at block {0}")]
    Overflow(u64),

    /// Malformed JSON.
    #[error("sprint table json: {0}")]
    Json(String),
}

/// A height range with a single sprint length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SprintRegime {
    /// First height of the regime.
    pub start: u64,
    /// Sprint length within the regime.
    pub length: u64,
    /// Global index of the regime's first sprint.
    pub first_sprint: u64,
}

impl SprintRegime {
    /// Global sprint index of `height`, which must lie in this regime.
    fn sprint_index(&self, height: u64) -> u64 {
        self.first_sprint + (height - self.start) / self.length
    }

    /// Number of sprints (the last possibly partial) before `next_start`.
    fn sprints_until(&self, next_start: u64) -> u64 {
        (next_start - self.start).div_ceil(self.length)
    }
}

/// Activation height → sprint length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SprintTable {
    regimes: Vec<SprintRegime>,
}

impl SprintTable {
    /// Build a table from `(activation height, length)` pairs.
    ///
    /// Entries may come in any order but heights must be distinct.
    pub fn new(
        entries: impl IntoIterator<Item = (u64, u64)>,
    ) -> Result<Self, SprintConfigError> {
        let mut sorted = BTreeMap::new();
        for (start, length) in entries {
            if sorted.insert(start, length).is_some() {
                return Err(SprintConfigError::DuplicateKey(start));
            }
        }
        Self::from_sorted(sorted)
    }

    /// A single regime with a fixed sprint length.
    pub fn fixed(length: u64) -> Result<Self, SprintConfigError> {
        Self::new([(0, length)])
    }

    /// Parse a JSON object such as `{"0": 16, "8": 4}`.
    pub fn from_json_str(json: &str) -> Result<Self, SprintConfigError> {
        let raw: RawSprintMap =
            serde_json::from_str(json).map_err(|e| SprintConfigError::Json(e.to_string()))?;
        raw.into_table()
    }

    fn from_sorted(entries: BTreeMap<u64, u64>) -> Result<Self, SprintConfigError> {
        if entries.is_empty() {
            return Err(SprintConfigError::Empty);
        }
        if !entries.contains_key(&0) {
            return Err(SprintConfigError::MissingGenesisEntry);
        }

        let mut regimes: Vec<SprintRegime> = Vec::with_capacity(entries.len());
        for (start, length) in entries {
            if length == 0 {
                return Err(SprintConfigError::ZeroLength(start));
            }
            let first_sprint = match regimes.last() {
                None => 0,
                Some(prev) => prev
                    .first_sprint
                    .checked_add(prev.sprints_until(start))
                    .ok_or(SprintConfigError::Overflow(start))?,
            };
            regimes.push(SprintRegime { start, length, first_sprint });
        }

        Ok(Self { regimes })
    }

    /// The regime active at `height`.
    pub fn regime_at(&self, height: u64) -> &SprintRegime {
        // Regime 0 starts at block 0, so the partition point is at least 1
        let idx = self.regimes.partition_point(|r| r.start <= height);
        &self.regimes[idx.saturating_sub(1)]
    }

    /// Sprint length active at `height`.
    pub fn sprint_length_at(&self, height: u64) -> u64 {
        self.regime_at(height).length
    }

    /// Global sprint index containing `height`.
    pub fn sprint_index(&self, height: u64) -> u64 {
        self.regime_at(height).sprint_index(height)
    }

    /// First height of the sprint containing `height`.
    pub fn sprint_start(&self, height: u64) -> u64 {
        let regime = self.regime_at(height);
        regime.start + (height - regime.start) / regime.length * regime.length
    }

    /// Whether `height` opens a sprint.
    pub fn is_sprint_start(&self, height: u64) -> bool {
        self.sprint_start(height) == height
    }

    /// All regimes, ascending by start height.
    pub fn regimes(&self) -> &[SprintRegime] {
        &self.regimes
    }
}

impl Serialize for SprintTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.regimes.len()))?;
        for regime in &self.regimes {
            map.serialize_entry(&regime.start.to_string(), &regime.length)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SprintTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        RawSprintMap::deserialize(deserializer)?
            .into_table()
            .map_err(serde::de::Error::custom)
    }
}

/// Key/value pairs exactly as they appear in the source, duplicates included.
struct RawSprintMap(Vec<(String, u64)>);

impl RawSprintMap {
    fn into_table(self) -> Result<SprintTable, SprintConfigError> {
        let mut entries = Vec::with_capacity(self.0.len());
        for (key, length) in self.0 {
            entries.push((parse_height(&key)?, length));
        }
        SprintTable::new(entries)
    }
}

impl<'de> Deserialize<'de> for RawSprintMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RawVisitor;

        impl<'de> Visitor<'de> for RawVisitor {
            type Value = RawSprintMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of decimal block numbers to sprint lengths")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, u64>()? {
                    entries.push((key, value));
                }
                Ok(RawSprintMap(entries))
            }
        }

        deserializer.deserialize_map(RawVisitor)
    }
}

fn parse_height(key: &str) -> Result<u64, SprintConfigError> {
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SprintConfigError::InvalidKey(key.to_string()));
    }
    key.parse().map_err(|_| SprintConfigError::InvalidKey(key.to_string()))
}
