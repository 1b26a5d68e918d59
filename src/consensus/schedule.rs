//! Sprint-based leader rotation.
//!
//! # Rotation
//!
//! ```text
//! Validators: [V0, V1, V2]     Sprint length: 4
//!
//! height  0..4   sprint 0  → V0 (diff 3), V1 (2), V2 (1)
//! height  4..8   sprint 1  → V1 (diff 3), V2 (2), V0 (1)
//! height  8..12  sprint 2  → V2 (diff 3), V0 (2), V1 (1)
//! height 12..16  sprint 3  → V0 ...
//! ```
//!
//! The primary for a sprint is `sprint_index mod validator_count`; backups
//! follow in rotation order, wrapping around. The difficulty a producer must
//! stamp is `validator_count - position`, so the primary always carries the
//! highest weight.

use super::{config::ValidatorSet, sprint::SprintTable};
use alloy_primitives::Address;
use std::{collections::BTreeMap, sync::Arc};

/// Schedule construction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// Epoch starts must strictly increase.
    #[error("epoch start {start} is not after the last epoch start {last}")]
    EpochNotIncreasing {
        /// Rejected start height.
        start: u64,
        /// Start of the most recent epoch.
        last: u64,
    },
}

/// Deterministic producer schedule: sprint table plus validator sets by epoch.
#[derive(Debug, Clone)]
pub struct LeaderSchedule {
    sprints: SprintTable,
    genesis: Arc<ValidatorSet>,
    /// Validator sets taking over after genesis, by start height.
    epochs: BTreeMap<u64, Arc<ValidatorSet>>,
    max_backups: Option<usize>,
}

impl LeaderSchedule {
    /// Create a schedule with `genesis_set` active from block 0.
    pub fn new(sprints: SprintTable, genesis_set: ValidatorSet) -> Self {
        Self {
            sprints,
            genesis: Arc::new(genesis_set),
            epochs: BTreeMap::new(),
            max_backups: None,
        }
    }

    /// Limit the number of backups eligible at each height.
    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        self.max_backups = Some(max_backups);
        self
    }

    /// Return a schedule where `set` takes over from height `start`.
    pub fn with_epoch(&self, start: u64, set: ValidatorSet) -> Result<Self, ScheduleError> {
        let last = self.epochs.keys().next_back().copied().unwrap_or(0);
        if start <= last {
            return Err(ScheduleError::EpochNotIncreasing { start, last });
        }
        let mut next = self.clone();
        next.epochs.insert(start, Arc::new(set));
        Ok(next)
    }

    /// The sprint table.
    pub fn sprints(&self) -> &SprintTable {
        &self.sprints
    }

    /// Configured backup limit.
    pub fn max_backups(&self) -> Option<usize> {
        self.max_backups
    }

    /// Sprint length active at `height`.
    pub fn sprint_length_at(&self, height: u64) -> u64 {
        self.sprints.sprint_length_at(height)
    }

    /// Global sprint index of `height`.
    pub fn sprint_index(&self, height: u64) -> u64 {
        self.sprints.sprint_index(height)
    }

    /// Validator set whose epoch covers `height`.
    pub fn validators_at(&self, height: u64) -> &Arc<ValidatorSet> {
        self.epochs
            .range(..=height)
            .next_back()
            .map(|(_, set)| set)
            .unwrap_or(&self.genesis)
    }

    /// Rotation index of the primary producer at `height`.
    pub fn primary_index(&self, height: u64) -> usize {
        let count = self.validators_at(height).len() as u64;
        (self.sprint_index(height) % count) as usize
    }

    /// Primary producer at `height`.
    pub fn primary(&self, height: u64) -> Address {
        let set = self.validators_at(height);
        set.validators()[self.primary_index(height)]
    }

    /// Eligible producer indices at `height`, primary first then backups.
    pub fn eligible_producers(&self, height: u64) -> Vec<usize> {
        let count = self.validators_at(height).len();
        let primary = self.primary_index(height);
        let eligible = match self.max_backups {
            Some(n) => count.min(n.saturating_add(1)),
            None => count,
        };
        (0..eligible).map(|offset| (primary + offset) % count).collect()
    }

    /// Eligible producer addresses at `height`, primary first.
    pub fn eligible_addresses(&self, height: u64) -> Vec<Address> {
        let set = self.validators_at(height);
        self.eligible_producers(height)
            .into_iter()
            .map(|idx| set.validators()[idx])
            .collect()
    }

    /// Position of `signer` in the eligible list at `height` (0 = primary).
    pub fn priority_of(&self, height: u64, signer: &Address) -> Option<usize> {
        let set = self.validators_at(height);
        let index = set.index_of(signer)?;
        let count = set.len();
        let position = (index + count - self.primary_index(height)) % count;
        let eligible = match self.max_backups {
            Some(n) => count.min(n.saturating_add(1)),
            None => count,
        };
        (position < eligible).then_some(position)
    }

    /// Difficulty `signer` must stamp at `height`, if eligible.
    pub fn expected_difficulty(&self, height: u64, signer: &Address) -> Option<u64> {
        let count = self.validators_at(height).len() as u64;
        self.priority_of(height, signer)
            .map(|position| count - position as u64)
    }

    /// Whether `signer` is the primary at `height`.
    pub fn is_in_turn(&self, height: u64, signer: &Address) -> bool {
        self.primary(height) == *signer
    }
}
