//! In-process chain simulation.
//!
//! Builds correctly sealed, correctly weighted header sequences for a set of
//! test validators, so competing branches can be fed straight into the head
//! tracker without any networking.

use crate::{
    consensus::{
        seal::secret_key_to_address, seal_header, LeaderSchedule, SprintTable, ValidatorSet,
    },
    primitives::{Header, SealedHeader, EXTRA_VANITY},
};
use alloy_primitives::{Address, Bytes, B256};
use secp256k1::SecretKey;

/// Seconds between simulated blocks.
pub const BLOCK_TIME: u64 = 2;

/// A validator with a real secp256k1 key.
#[derive(Debug, Clone)]
pub struct TestValidator {
    secret_key: SecretKey,
    address: Address,
}

impl TestValidator {
    /// Deterministic validator whose key is `[seed; 32]`, seed clamped to `1..=254`.
    pub fn from_seed(seed: u8) -> Self {
        let secret_key = SecretKey::from_slice(&[seed.clamp(1, 0xfe); 32])
            .unwrap_or_else(|err| panic!("invalid test key seed {seed}: {err}"));
        Self::from_secret_key(secret_key)
    }

    /// Validator controlling `secret_key`.
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        Self { address: secret_key_to_address(&secret_key), secret_key }
    }

    /// Producer address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Signing key.
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// Seal `header` with this validator's key.
    pub fn seal(&self, header: Header) -> SealedHeader {
        seal_header(header, &self.secret_key).seal_slow()
    }
}

/// `count` validators with seeds `1..=count`.
pub fn test_validators(count: usize) -> Vec<TestValidator> {
    (1..=count).map(|seed| TestValidator::from_seed(seed as u8)).collect()
}

/// The unsealed block 0.
pub fn genesis_header() -> SealedHeader {
    Header {
        parent_hash: B256::ZERO,
        number: 0,
        timestamp: 0,
        difficulty: 1,
        extra_data: Bytes::from(vec![0u8; EXTRA_VANITY]),
    }
    .seal_slow()
}

/// Schedule over `validators` in the given order.
pub fn schedule_for(validators: &[TestValidator], sprints: SprintTable) -> LeaderSchedule {
    let set = ValidatorSet::new(validators.iter().map(TestValidator::address).collect())
        .unwrap_or_else(|err| panic!("invalid test validator set: {err}"));
    LeaderSchedule::new(sprints, set)
}

/// Extends a base header one sealed header at a time.
///
/// Every header carries the difficulty the schedule assigns to its producer,
/// and a vanity tag so two branches produced by the same validators never
/// collide on hash.
#[derive(Debug)]
pub struct BranchBuilder<'a> {
    schedule: &'a LeaderSchedule,
    validators: &'a [TestValidator],
    tip: SealedHeader,
    tag: u8,
    headers: Vec<SealedHeader>,
}

impl<'a> BranchBuilder<'a> {
    /// Start a branch on top of `base`.
    pub fn new(
        schedule: &'a LeaderSchedule,
        validators: &'a [TestValidator],
        base: &SealedHeader,
    ) -> Self {
        Self { schedule, validators, tip: base.clone(), tag: 0, headers: Vec::new() }
    }

    /// Set the vanity tag for headers pushed from now on.
    pub fn with_tag(mut self, tag: u8) -> Self {
        self.tag = tag;
        self
    }

    /// Push a header sealed by `validators[index]` with the scheduled difficulty.
    ///
    /// Ineligible producers get difficulty 0.
    pub fn push_by(&mut self, index: usize) -> &SealedHeader {
        let number = self.tip.number + 1;
        let difficulty = self
            .schedule
            .expected_difficulty(number, &self.validators[index].address())
            .unwrap_or(0);
        self.push_with_difficulty(index, difficulty)
    }

    /// Push a header sealed by `validators[index]` with an explicit difficulty.
    pub fn push_with_difficulty(&mut self, index: usize, difficulty: u64) -> &SealedHeader {
        let mut vanity = vec![0u8; EXTRA_VANITY];
        vanity[0] = self.tag;
        let header = Header {
            parent_hash: self.tip.hash(),
            number: self.tip.number + 1,
            timestamp: self.tip.timestamp + BLOCK_TIME,
            difficulty,
            extra_data: vanity.into(),
        };
        let sealed = self.validators[index].seal(header);
        self.tip = sealed.clone();
        self.headers.push(sealed);
        &self.tip
    }

    /// Push a header sealed by the scheduled primary.
    pub fn push_primary(&mut self) -> &SealedHeader {
        let number = self.tip.number + 1;
        let primary = self.schedule.primary(number);
        let index = self
            .validators
            .iter()
            .position(|v| v.address() == primary)
            .unwrap_or_else(|| {
                panic!("primary {primary} at block {number} is not a test validator")
            });
        self.push_by(index)
    }

    /// Push `count` headers sealed by their scheduled primaries.
    pub fn extend_primary(&mut self, count: u64) -> &mut Self {
        for _ in 0..count {
            self.push_primary();
        }
        self
    }

    /// Push `count` headers all sealed by `validators[index]`.
    pub fn extend_by(&mut self, index: usize, count: u64) -> &mut Self {
        for _ in 0..count {
            self.push_by(index);
        }
        self
    }

    /// Latest header on the branch (the base before anything is pushed).
    pub fn tip(&self) -> &SealedHeader {
        &self.tip
    }

    /// Headers pushed so far, oldest first.
    pub fn headers(&self) -> &[SealedHeader] {
        &self.headers
    }

    /// Consume the builder, returning the pushed headers.
    pub fn into_headers(self) -> Vec<SealedHeader> {
        self.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{SealRecovery, Secp256k1Recovery};

    #[test]
    fn test_branch_links_and_weights() {
        let validators = test_validators(3);
        let schedule = schedule_for(&validators, SprintTable::fixed(2).unwrap());
        let genesis = genesis_header();

        let mut builder = BranchBuilder::new(&schedule, &validators, &genesis);
        builder.extend_primary(6);
        let headers = builder.into_headers();

        let recovery = Secp256k1Recovery::new();
        let mut parent = genesis;
        for header in &headers {
            assert_eq!(header.parent_hash, parent.hash());
            assert_eq!(header.number, parent.number + 1);
            assert_eq!(header.difficulty, 3);
            let signer = recovery.recover_signer(header.header()).unwrap();
            assert_eq!(signer, schedule.primary(header.number));
            parent = header.clone();
        }
    }

    #[test]
    fn test_tags_separate_branches() {
        let validators = test_validators(2);
        let schedule = schedule_for(&validators, SprintTable::fixed(1).unwrap());
        let genesis = genesis_header();

        let mut a = BranchBuilder::new(&schedule, &validators, &genesis).with_tag(1);
        let mut b = BranchBuilder::new(&schedule, &validators, &genesis).with_tag(2);
        let ha = a.push_by(0).hash();
        let hb = b.push_by(0).hash();

        assert_ne!(ha, hb);
        assert_eq!(a.tip().difficulty, b.tip().difficulty);
    }
}
