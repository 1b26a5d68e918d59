//! Chain configuration and validator set management.

use super::{
    head_tracker::TrackerConfig,
    schedule::LeaderSchedule,
    sprint::{SprintConfigError, SprintTable},
    verifier::ConsensusVerifier,
};
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path};

/// Validator set construction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidatorSetError {
    /// At least one producer is required.
    #[error("validator set is empty")]
    Empty,

    /// The same address listed twice.
    #[error("duplicate validator {0}")]
    Duplicate(Address),
}

/// Chain configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading the configuration file failed.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// JSON parse error.
    #[error("invalid chain config: {0}")]
    Json(#[from] serde_json::Error),

    /// Sprint table error.
    #[error(transparent)]
    Sprint(#[from] SprintConfigError),

    /// Validator set error.
    #[error(transparent)]
    Validators(#[from] ValidatorSetError),

    /// A tunable is out of range.
    #[error("invalid {field}: {reason}")]
    InvalidValue {
        /// Config key.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Ordered set of block producers. Order defines rotation.
///
/// Sets are immutable snapshots; a new epoch gets a new set with a higher
/// version rather than mutating the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Address>", into = "Vec<Address>")]
pub struct ValidatorSet {
    /// Ordered list of validator addresses
    validators: Vec<Address>,
    /// Set for O(1) membership check
    set: HashSet<Address>,
    version: u64,
}

impl ValidatorSet {
    /// Create a validator set at version 0.
    pub fn new(validators: Vec<Address>) -> Result<Self, ValidatorSetError> {
        if validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }
        let mut set = HashSet::with_capacity(validators.len());
        for addr in &validators {
            if !set.insert(*addr) {
                return Err(ValidatorSetError::Duplicate(*addr));
            }
        }
        Ok(Self { validators, set, version: 0 })
    }

    /// Tag the set with a version number.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Snapshot version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Check if an address is a validator.
    pub fn contains(&self, address: &Address) -> bool {
        self.set.contains(address)
    }

    /// Number of validators (never zero).
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Never true for a constructed set.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Validator at `index` in rotation order.
    pub fn get(&self, index: usize) -> Option<Address> {
        self.validators.get(index).copied()
    }

    /// Rotation position of `address`.
    pub fn index_of(&self, address: &Address) -> Option<usize> {
        self.validators.iter().position(|v| v == address)
    }

    /// All validators in rotation order.
    pub fn validators(&self) -> &[Address] {
        &self.validators
    }
}

impl TryFrom<Vec<Address>> for ValidatorSet {
    type Error = ValidatorSetError;

    fn try_from(validators: Vec<Address>) -> Result<Self, Self::Error> {
        Self::new(validators)
    }
}

impl From<ValidatorSet> for Vec<Address> {
    fn from(set: ValidatorSet) -> Self {
        set.validators
    }
}

fn default_max_reorg_depth() -> u64 {
    super::fork_choice::MAX_REORG_DEPTH
}

fn default_retention_depth() -> u64 {
    super::block_tree::DEFAULT_RETENTION_DEPTH
}

fn default_event_buffer() -> usize {
    super::subscription::DEFAULT_EVENT_BUFFER
}

/// Chain configuration as loaded from JSON.
///
/// ```json
/// {
///   "sprint": {"0": 16, "8": 4},
///   "validators": ["0x…", "0x…"],
///   "recentWindow": 1,
///   "maxReorgDepth": 64
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    /// Sprint lengths by activation height.
    pub sprint: SprintTable,
    /// Genesis validator set.
    pub validators: ValidatorSet,
    /// Recent-signer window in sprints. `None` means half the validator count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_window: Option<u64>,
    /// Backups per height. `None` means every other validator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backups: Option<usize>,
    /// Deepest accepted reorg.
    #[serde(default = "default_max_reorg_depth")]
    pub max_reorg_depth: u64,
    /// Headers kept below the head.
    #[serde(default = "default_retention_depth")]
    pub retention_depth: u64,
    /// Per-subscriber event channel capacity.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl ChainConfig {
    /// Parse and validate a JSON chain configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON chain configuration from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.event_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "eventBuffer",
                reason: "must be at least 1",
            });
        }
        // A side branch forking at the deepest allowed point still needs the
        // recent-signer history below it
        let required = self.max_reorg_depth.saturating_add(self.signer_history_depth());
        if self.retention_depth < required {
            return Err(ConfigError::InvalidValue {
                field: "retentionDepth",
                reason: "must cover maxReorgDepth plus recentWindow + 1 of the longest sprints",
            });
        }
        Ok(())
    }

    /// Headers below a new block that the recent-signer check may read.
    ///
    /// The walk spans the header's own sprint plus `window` earlier ones, and
    /// reads one more header to find the window's lower edge. Near genesis it
    /// stops at block 1 instead, which is always shallower than this bound.
    /// Zero when the check is disabled.
    pub fn signer_history_depth(&self) -> u64 {
        let window = self.recent_window.unwrap_or(self.validators.len() as u64 / 2);
        if window == 0 {
            return 0;
        }
        let longest = self.sprint.regimes().iter().map(|r| r.length).max().unwrap_or(1);
        window.saturating_add(1).saturating_mul(longest)
    }

    /// Leader schedule for the genesis validator set.
    pub fn schedule(&self) -> LeaderSchedule {
        let schedule = LeaderSchedule::new(self.sprint.clone(), self.validators.clone());
        match self.max_backups {
            Some(n) => schedule.with_max_backups(n),
            None => schedule,
        }
    }

    /// Verifier over [`Self::schedule`].
    pub fn verifier(&self) -> ConsensusVerifier {
        let verifier = ConsensusVerifier::new(self.schedule());
        match self.recent_window {
            Some(w) => verifier.with_recent_window(w),
            None => verifier,
        }
    }

    /// Head tracker tunables.
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig::default()
            .with_max_reorg_depth(self.max_reorg_depth)
            .with_retention_depth(self.retention_depth)
            .with_event_buffer(self.event_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_validators() -> Vec<Address> {
        vec![
            Address::repeat_byte(0x01),
            Address::repeat_byte(0x02),
            Address::repeat_byte(0x03),
            Address::repeat_byte(0x04),
        ]
    }

    #[test]
    fn test_validator_set_order_and_membership() {
        let set = ValidatorSet::new(test_validators()).unwrap().with_version(3);

        assert_eq!(set.len(), 4);
        assert_eq!(set.version(), 3);
        assert_eq!(set.get(2), Some(Address::repeat_byte(0x03)));
        assert_eq!(set.get(4), None);
        assert_eq!(set.index_of(&Address::repeat_byte(0x04)), Some(3));
        assert!(set.contains(&Address::repeat_byte(0x01)));
        assert!(!set.contains(&Address::repeat_byte(0xFF)));
    }

    #[test]
    fn test_validator_set_rejects_empty_and_duplicates() {
        assert_eq!(ValidatorSet::new(vec![]), Err(ValidatorSetError::Empty));

        let mut dup = test_validators();
        dup.push(Address::repeat_byte(0x02));
        assert_eq!(
            ValidatorSet::new(dup),
            Err(ValidatorSetError::Duplicate(Address::repeat_byte(0x02)))
        );
    }

    #[test]
    fn test_chain_config_defaults() {
        let json = r#"{
            "sprint": {"0": 16, "8": 4},
            "validators": [
                "0x0101010101010101010101010101010101010101",
                "0x0202020202020202020202020202020202020202"
            ]
        }"#;
        let config = ChainConfig::from_json_str(json).unwrap();

        assert_eq!(config.sprint.sprint_length_at(8), 4);
        assert_eq!(config.validators.len(), 2);
        assert_eq!(config.recent_window, None);
        assert_eq!(config.max_backups, None);
        assert_eq!(config.max_reorg_depth, 64);
        assert_eq!(config.retention_depth, 256);
        assert_eq!(config.event_buffer, 64);

        let tracker = config.tracker_config();
        assert_eq!(tracker.max_reorg_depth, 64);
        assert_eq!(tracker.event_buffer, 64);
    }

    #[test]
    fn test_chain_config_overrides() {
        let json = r#"{
            "sprint": {"0": 1},
            "validators": [
                "0x0101010101010101010101010101010101010101",
                "0x0202020202020202020202020202020202020202",
                "0x0303030303030303030303030303030303030303"
            ],
            "recentWindow": 2,
            "maxBackups": 1,
            "maxReorgDepth": 8,
            "retentionDepth": 16,
            "eventBuffer": 4
        }"#;
        let config = ChainConfig::from_json_str(json).unwrap();

        assert_eq!(config.recent_window, Some(2));
        assert_eq!(config.verifier().recent_window_at(0), 2);
        assert_eq!(config.schedule().eligible_producers(0).len(), 2);
        assert_eq!(config.tracker_config().retention_depth, 16);
    }

    #[test]
    fn test_chain_config_rejections() {
        let dup = r#"{
            "sprint": {"0": 4},
            "validators": [
                "0x0101010101010101010101010101010101010101",
                "0x0101010101010101010101010101010101010101"
            ]
        }"#;
        assert!(matches!(ChainConfig::from_json_str(dup), Err(ConfigError::Json(_))));

        let no_genesis = r#"{
            "sprint": {"4": 4},
            "validators": ["0x0101010101010101010101010101010101010101"]
        }"#;
        let err = ChainConfig::from_json_str(no_genesis).unwrap_err();
        assert!(err.to_string().contains("block 0"));

        let zero_buffer = r#"{
            "sprint": {"0": 4},
            "validators": ["0x0101010101010101010101010101010101010101"],
            "eventBuffer": 0
        }"#;
        assert!(matches!(
            ChainConfig::from_json_str(zero_buffer),
            Err(ConfigError::InvalidValue { field: "eventBuffer", .. })
        ));
    }

    fn config_json(validators: &[Address], sprint: u64, max_reorg: u64, retention: u64) -> String {
        serde_json::json!({
            "sprint": {"0": sprint},
            "validators": validators,
            "maxReorgDepth": max_reorg,
            "retentionDepth": retention,
        })
        .to_string()
    }

    #[test]
    fn test_signer_history_depth() {
        let json = config_json(&test_validators(), 8, 8, 64);
        let config = ChainConfig::from_json_str(&json).unwrap();
        // Window 2 (4 validators / 2), three sprints of 8
        assert_eq!(config.signer_history_depth(), 24);

        let mut disabled = config.clone();
        disabled.recent_window = Some(0);
        assert_eq!(disabled.signer_history_depth(), 0);

        let mut regimes = config;
        regimes.sprint = SprintTable::new([(0, 4), (16, 16), (64, 2)]).unwrap();
        assert_eq!(regimes.signer_history_depth(), 48);
    }

    #[test]
    fn test_retention_must_cover_signer_history() {
        let validators = test_validators();
        let err = ChainConfig::from_json_str(&config_json(&validators, 8, 8, 8)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "retentionDepth", .. }));

        // 8 reorg + 24 history
        assert!(ChainConfig::from_json_str(&config_json(&validators, 8, 8, 31)).is_err());
        assert!(ChainConfig::from_json_str(&config_json(&validators, 8, 8, 32)).is_ok());

        // Large sets need deep history: 100 validators, sprint 16 → 51 sprints
        let many: Vec<Address> = (1..=100u8).map(Address::repeat_byte).collect();
        assert!(ChainConfig::from_json_str(&config_json(&many, 16, 64, 256)).is_err());
        assert!(ChainConfig::from_json_str(&config_json(&many, 16, 64, 880)).is_ok());
    }

    #[test]
    fn test_minimal_retention_keeps_honest_chain_live() {
        use crate::{
            consensus::{BlockImporter, ChainHeadTracker, ImportOutcome},
            simulation::{genesis_header, test_validators as keyed_validators, BranchBuilder},
        };
        use std::sync::Arc;

        let validators = keyed_validators(4);
        let addresses: Vec<Address> = validators.iter().map(|v| v.address()).collect();
        let config = ChainConfig::from_json_str(&config_json(&addresses, 8, 8, 32)).unwrap();
        let schedule = config.schedule();
        let genesis = genesis_header();

        let tracker = Arc::new(ChainHeadTracker::new(genesis.clone(), config.tracker_config()));
        let importer = BlockImporter::new(Arc::new(config.verifier()), Arc::clone(&tracker));

        // Well past the retention depth, so early blocks are pruned
        let mut branch = BranchBuilder::new(&schedule, &validators, &genesis);
        branch.extend_primary(100);
        for header in branch.into_headers() {
            let number = header.number;
            let outcome = importer.import_header(header);
            assert_eq!(outcome, Ok(ImportOutcome::Extended), "block {number}");
        }
        assert!(!tracker.contains(&genesis.hash()));
        assert_eq!(tracker.head_info().number, 100);

        // A backup fork at the deepest allowed point still verifies
        let fork_base = tracker.canonical_chain()[tracker.canonical_chain().len() - 9].clone();
        assert_eq!(fork_base.number, 92);
        let mut fork = BranchBuilder::new(&schedule, &validators, &fork_base).with_tag(1);
        let number = fork_base.number + 1;
        let backup = (schedule.primary_index(number) + 1) % validators.len();
        let header = fork.push_by(backup).clone();
        assert!(config.verifier().verify_header(&header, tracker.as_ref()).is_ok());
    }

    #[test]
    fn test_from_file_missing() {
        let err = ChainConfig::from_file("/nonexistent/chain.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
