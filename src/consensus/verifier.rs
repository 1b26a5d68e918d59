//! Producer authorization.
//!
//! [`ConsensusVerifier`] answers "who produced this header, and were they
//! allowed to?" against the active [`LeaderSchedule`]. It never mutates chain
//! state: ancestors are read through [`HeaderReader`], and the schedule is an
//! immutable snapshot swapped atomically by [`ConsensusVerifier::update_schedule`].

use super::{
    schedule::LeaderSchedule,
    seal::{SealError, SealRecovery, Secp256k1Recovery},
};
use crate::primitives::SealedHeader;
use alloy_primitives::{Address, B256};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::{collections::HashMap, fmt, num::NonZeroUsize, sync::Arc};
use tracing::{debug, trace, warn, Span};

/// Number of recovered signers kept in memory.
pub const SIGNATURE_CACHE_SIZE: usize = 4096;

/// Read access to known headers.
pub trait HeaderReader {
    /// Header with the given hash, if known.
    fn header_by_hash(&self, hash: &B256) -> Option<SealedHeader>;
}

impl<T: HeaderReader + ?Sized> HeaderReader for Arc<T> {
    fn header_by_hash(&self, hash: &B256) -> Option<SealedHeader> {
        (**self).header_by_hash(hash)
    }
}

impl HeaderReader for HashMap<B256, SealedHeader> {
    fn header_by_hash(&self, hash: &B256) -> Option<SealedHeader> {
        self.get(hash).cloned()
    }
}

/// Why an authorized validator may not produce at a height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRejection {
    /// Neither the primary nor an allowed backup.
    NotEligible,
    /// Produced a block within the recent-signer window.
    RecentlySigned {
        /// Height of the earlier block.
        block: u64,
    },
}

impl fmt::Display for SlotRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotEligible => f.write_str("not eligible"),
            Self::RecentlySigned { block } => write!(f, "recently signed block {block}"),
        }
    }
}

/// Header verification errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// Block 0 carries no seal.
    #[error("genesis header is unsealed")]
    UnsealedGenesis,

    /// Seal missing or not recoverable.
    #[error("invalid seal: {0}")]
    InvalidSeal(#[from] SealError),

    /// Recovered signer is not in the validator set.
    #[error("unknown signer {signer} at block {number}")]
    UnknownSigner {
        /// Recovered signer.
        signer: Address,
        /// Header height.
        number: u64,
    },

    /// Signer may not produce at this height.
    #[error("unauthorized slot for {signer} at block {number}: {reason}")]
    UnauthorizedSlot {
        /// Recovered signer.
        signer: Address,
        /// Header height.
        number: u64,
        /// Rejection reason.
        reason: SlotRejection,
    },

    /// Difficulty does not match the signer's position.
    #[error("wrong difficulty at block {number}: expected {expected}, got {actual}")]
    WrongDifficulty {
        /// Header height.
        number: u64,
        /// Difficulty implied by the schedule.
        expected: u64,
        /// Difficulty in the header.
        actual: u64,
    },

    /// An ancestor needed for the recent-signer check is not known.
    #[error("unknown ancestor {hash} below block {number}")]
    UnknownAncestor {
        /// Missing header hash.
        hash: B256,
        /// Height of the header whose parent is missing.
        number: u64,
    },
}

/// Stateless producer verification against a leader schedule.
pub struct ConsensusVerifier<R = Secp256k1Recovery> {
    schedule: RwLock<Arc<LeaderSchedule>>,
    recovery: R,
    /// Recovered signers by header hash.
    signatures: Mutex<LruCache<B256, Address>>,
    /// Recent-signer window in sprints; `None` means half the validator count.
    recent_window: Option<u64>,
    span: Span,
}

impl ConsensusVerifier {
    /// Create a verifier with secp256k1 seal recovery.
    pub fn new(schedule: LeaderSchedule) -> Self {
        Self::with_recovery(schedule, Secp256k1Recovery::new())
    }
}

impl<R: SealRecovery> ConsensusVerifier<R> {
    /// Create a verifier with a custom seal recovery.
    pub fn with_recovery(schedule: LeaderSchedule, recovery: R) -> Self {
        Self {
            schedule: RwLock::new(Arc::new(schedule)),
            recovery,
            signatures: Mutex::new(LruCache::new(
                NonZeroUsize::new(SIGNATURE_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
            recent_window: None,
            span: Span::none(),
        }
    }

    /// Fix the recent-signer window, in sprints. Zero disables the check.
    pub fn with_recent_window(mut self, sprints: u64) -> Self {
        self.recent_window = Some(sprints);
        self
    }

    /// Resize the signer cache.
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.signatures = Mutex::new(LruCache::new(
            NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN),
        ));
        self
    }

    /// Attach the span all verifier events are recorded under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Current schedule snapshot.
    pub fn schedule(&self) -> Arc<LeaderSchedule> {
        self.schedule.read().clone()
    }

    /// Swap in a new schedule. Verifications already running keep the old one.
    pub fn update_schedule(&self, schedule: LeaderSchedule) {
        let schedule = Arc::new(schedule);
        debug!(
            target: "poa::verifier",
            parent: &self.span,
            validators = schedule.validators_at(u64::MAX).len(),
            "Schedule updated"
        );
        *self.schedule.write() = schedule;
    }

    /// Recent-signer window in sprints at `height`.
    pub fn recent_window_at(&self, height: u64) -> u64 {
        self.recent_window
            .unwrap_or_else(|| self.schedule().validators_at(height).len() as u64 / 2)
    }

    /// Recover the signer of a sealed header, consulting the cache first.
    pub fn recover(&self, header: &SealedHeader) -> Result<Address, VerifyError> {
        if header.number == 0 {
            return Err(VerifyError::UnsealedGenesis);
        }

        let hash = header.hash();
        if let Some(signer) = self.signatures.lock().get(&hash) {
            trace!(target: "poa::verifier", parent: &self.span, %hash, "Signer cache hit");
            return Ok(*signer);
        }

        let signer = self.recovery.recover_signer(header.header())?;
        self.signatures.lock().put(hash, signer);
        Ok(signer)
    }

    /// Recover the producer of `header` and check it was allowed to produce.
    pub fn author_of<C: HeaderReader + ?Sized>(
        &self,
        header: &SealedHeader,
        chain: &C,
    ) -> Result<Address, VerifyError> {
        let schedule = self.schedule();
        self.author_with(&schedule, header, chain)
    }

    /// [`Self::author_of`] plus the difficulty check.
    pub fn verify_header<C: HeaderReader + ?Sized>(
        &self,
        header: &SealedHeader,
        chain: &C,
    ) -> Result<Address, VerifyError> {
        let schedule = self.schedule();
        let result = self.author_with(&schedule, header, chain).and_then(|signer| {
            let expected = schedule
                .expected_difficulty(header.number, &signer)
                .unwrap_or_default();
            if header.difficulty != expected {
                return Err(VerifyError::WrongDifficulty {
                    number: header.number,
                    expected,
                    actual: header.difficulty,
                });
            }
            Ok(signer)
        });

        if let Err(err) = &result {
            warn!(
                target: "poa::verifier",
                parent: &self.span,
                number = header.number,
                hash = %header.hash(),
                %err,
                "Rejected header"
            );
        }
        result
    }

    /// Verify many headers in parallel.
    ///
    /// Ancestors may come from `chain` or from earlier entries of `headers`.
    /// Results are returned in input order.
    pub fn verify_batch<C: HeaderReader + Sync + ?Sized>(
        &self,
        headers: &[SealedHeader],
        chain: &C,
    ) -> Vec<Result<Address, VerifyError>> {
        let overlay = BatchOverlay {
            chain,
            batch: headers.iter().map(|h| (h.hash(), h)).collect(),
        };
        headers
            .par_iter()
            .map(|header| self.verify_header(header, &overlay))
            .collect()
    }

    fn author_with<C: HeaderReader + ?Sized>(
        &self,
        schedule: &LeaderSchedule,
        header: &SealedHeader,
        chain: &C,
    ) -> Result<Address, VerifyError> {
        let number = header.number;
        let signer = self.recover(header)?;

        if !schedule.validators_at(number).contains(&signer) {
            return Err(VerifyError::UnknownSigner { signer, number });
        }

        if schedule.priority_of(number, &signer).is_none() {
            return Err(VerifyError::UnauthorizedSlot {
                signer,
                number,
                reason: SlotRejection::NotEligible,
            });
        }

        let window = self
            .recent_window
            .unwrap_or_else(|| schedule.validators_at(number).len() as u64 / 2);
        if let Some(block) = self.recent_block_by(schedule, window, header, signer, chain)? {
            return Err(VerifyError::UnauthorizedSlot {
                signer,
                number,
                reason: SlotRejection::RecentlySigned { block },
            });
        }

        Ok(signer)
    }

    /// Height of a block `signer` produced in the `window` sprints before
    /// `header`'s sprint, if any.
    fn recent_block_by<C: HeaderReader + ?Sized>(
        &self,
        schedule: &LeaderSchedule,
        window: u64,
        header: &SealedHeader,
        signer: Address,
        chain: &C,
    ) -> Result<Option<u64>, VerifyError> {
        if window == 0 {
            return Ok(None);
        }

        let sprint = schedule.sprint_index(header.number);
        let oldest = sprint.saturating_sub(window);

        let mut child_number = header.number;
        let mut parent_hash = header.parent_hash;
        while child_number > 1 {
            let ancestor = chain.header_by_hash(&parent_hash).ok_or(
                VerifyError::UnknownAncestor { hash: parent_hash, number: child_number },
            )?;

            let ancestor_sprint = schedule.sprint_index(ancestor.number);
            if ancestor_sprint < oldest {
                break;
            }
            // Blocks in the signer's own sprint never count against it
            if ancestor_sprint < sprint && self.recover(&ancestor)? == signer {
                return Ok(Some(ancestor.number));
            }

            child_number = ancestor.number;
            parent_hash = ancestor.parent_hash;
        }
        Ok(None)
    }
}

impl<R> fmt::Debug for ConsensusVerifier<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusVerifier")
            .field("recent_window", &self.recent_window)
            .field("cached_signers", &self.signatures.lock().len())
            .finish_non_exhaustive()
    }
}

/// Chain view extended with the headers of a batch under verification.
struct BatchOverlay<'a, C: ?Sized> {
    chain: &'a C,
    batch: HashMap<B256, &'a SealedHeader>,
}

impl<C: HeaderReader + ?Sized> HeaderReader for BatchOverlay<'_, C> {
    fn header_by_hash(&self, hash: &B256) -> Option<SealedHeader> {
        match self.batch.get(hash) {
            Some(header) => Some((*header).clone()),
            None => self.chain.header_by_hash(hash),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consensus::{sprint::SprintTable, ValidatorSet},
        primitives::Header,
        simulation::{genesis_header, schedule_for, test_validators, BranchBuilder, TestValidator},
    };

    fn empty_chain() -> HashMap<B256, SealedHeader> {
        HashMap::new()
    }

    fn chain_of(headers: &[SealedHeader]) -> HashMap<B256, SealedHeader> {
        headers.iter().map(|h| (h.hash(), h.clone())).collect()
    }

    #[test]
    fn test_author_of_primary() {
        let validators = test_validators(3);
        let schedule = schedule_for(&validators, SprintTable::fixed(2).unwrap());
        let genesis = genesis_header();

        let mut branch = BranchBuilder::new(&schedule, &validators, &genesis);
        branch.extend_primary(5);
        let headers = branch.into_headers();

        let mut known = vec![genesis];
        let verifier = ConsensusVerifier::new(schedule.clone());
        for header in &headers {
            let chain = chain_of(&known);
            let signer = verifier.verify_header(header, &chain).unwrap();
            assert_eq!(signer, schedule.primary(header.number));
            known.push(header.clone());
        }
    }

    #[test]
    fn test_genesis_is_unsealed() {
        let validators = test_validators(2);
        let schedule = schedule_for(&validators, SprintTable::fixed(1).unwrap());
        let verifier = ConsensusVerifier::new(schedule);
        let genesis = genesis_header();

        assert_eq!(
            verifier.author_of(&genesis, &empty_chain()),
            Err(VerifyError::UnsealedGenesis)
        );
    }

    #[test]
    fn test_foreign_key_is_unknown_signer() {
        let validators = test_validators(2);
        let schedule = schedule_for(&validators, SprintTable::fixed(1).unwrap());
        let verifier = ConsensusVerifier::new(schedule);
        let genesis = genesis_header();
        let outsider = TestValidator::from_seed(0x77);

        let header = outsider.seal(Header {
            parent_hash: genesis.hash(),
            number: 1,
            timestamp: 1,
            difficulty: 2,
            extra_data: Default::default(),
        });
        let result = verifier.author_of(&header, &chain_of(&[genesis]));
        assert_eq!(
            result,
            Err(VerifyError::UnknownSigner { signer: outsider.address(), number: 1 })
        );
    }

    #[test]
    fn test_missing_seal_is_invalid() {
        let validators = test_validators(2);
        let schedule = schedule_for(&validators, SprintTable::fixed(1).unwrap());
        let verifier = ConsensusVerifier::new(schedule);
        let header = Header { number: 3, ..Default::default() }.seal_slow();

        assert!(matches!(
            verifier.author_of(&header, &empty_chain()),
            Err(VerifyError::InvalidSeal(SealError::MissingSeal { .. }))
        ));
    }

    #[test]
    fn test_not_eligible_with_max_backups() {
        let validators = test_validators(4);
        let schedule =
            schedule_for(&validators, SprintTable::fixed(1).unwrap()).with_max_backups(1);
        let verifier = ConsensusVerifier::new(schedule.clone()).with_recent_window(0);
        let genesis = genesis_header();

        // Height 1: primary V1, backup V2, V3 and V0 not eligible
        let mut branch = BranchBuilder::new(&schedule, &validators, &genesis);
        let header = branch.push_by(3).clone();
        let result = verifier.author_of(&header, &chain_of(&[genesis]));
        assert_eq!(
            result,
            Err(VerifyError::UnauthorizedSlot {
                signer: validators[3].address(),
                number: 1,
                reason: SlotRejection::NotEligible,
            })
        );
    }

    #[test]
    fn test_recently_signed_counts_sprints() {
        let validators = test_validators(4);
        let schedule = schedule_for(&validators, SprintTable::fixed(2).unwrap());
        // Window of 2 sprints (4 validators / 2)
        let verifier = ConsensusVerifier::new(schedule.clone());
        assert_eq!(verifier.recent_window_at(0), 2);
        let genesis = genesis_header();

        // Heights 1 (sprint 0, V0) then 2..3 (sprint 1, V1)
        let mut branch = BranchBuilder::new(&schedule, &validators, &genesis);
        branch.extend_primary(3);
        let mut known = vec![genesis.clone()];
        known.extend_from_slice(branch.headers());

        // Height 4 is sprint 2: V0 produced in sprint 0, inside the window
        let header = branch.push_by(0).clone();
        let result = verifier.author_of(&header, &chain_of(&known));
        assert_eq!(
            result,
            Err(VerifyError::UnauthorizedSlot {
                signer: validators[0].address(),
                number: 4,
                reason: SlotRejection::RecentlySigned { block: 1 },
            })
        );

        // V3 signed nothing recently
        let mut alt = BranchBuilder::new(&schedule, &validators, known.last().unwrap());
        let header = alt.push_by(3).clone();
        assert_eq!(verifier.author_of(&header, &chain_of(&known)), Ok(validators[3].address()));
    }

    #[test]
    fn test_recently_signed_across_sprint_regimes() {
        let validators = test_validators(4);
        // Sprints 0..1 are 8 blocks long, sprint 2 starts at 16 with length 4
        let sprints = SprintTable::new([(0, 8), (16, 4)]).unwrap();
        let schedule = schedule_for(&validators, sprints);
        let verifier = ConsensusVerifier::new(schedule.clone());
        let genesis = genesis_header();
        assert_eq!(schedule.sprint_index(15), 1);
        assert_eq!(schedule.sprint_index(16), 2);
        assert_eq!(schedule.sprint_index(20), 3);

        // V0 for sprint 0, V1 opens sprint 1 and V3 finishes it, V2 for sprint 2
        let mut branch = BranchBuilder::new(&schedule, &validators, &genesis);
        branch.extend_primary(8).extend_by(3, 7).extend_primary(4);
        assert_eq!(branch.tip().number, 19);
        let results = verifier.verify_batch(branch.headers(), &chain_of(&[genesis.clone()]));
        assert!(results.iter().all(Result::is_ok), "{results:?}");

        let mut known = vec![genesis];
        known.extend_from_slice(branch.headers());
        let chain = chain_of(&known);
        let tip = branch.tip().clone();
        let at_twenty = |index: usize| {
            let mut next = BranchBuilder::new(&schedule, &validators, &tip);
            next.push_by(index).clone()
        };

        // Sprint 3 looks back over sprints 1..2, twelve blocks down to height 8
        assert_eq!(
            verifier.author_of(&at_twenty(1), &chain),
            Err(VerifyError::UnauthorizedSlot {
                signer: validators[1].address(),
                number: 20,
                reason: SlotRejection::RecentlySigned { block: 8 },
            })
        );
        assert_eq!(
            verifier.author_of(&at_twenty(3), &chain),
            Err(VerifyError::UnauthorizedSlot {
                signer: validators[3].address(),
                number: 20,
                reason: SlotRejection::RecentlySigned { block: 15 },
            })
        );
        // Sprint 0 has left the window
        assert_eq!(verifier.author_of(&at_twenty(0), &chain), Ok(validators[0].address()));
    }

    #[test]
    fn test_window_reaching_past_first_sprint() {
        let validators = test_validators(4);
        let sprints = SprintTable::new([(0, 8), (16, 4)]).unwrap();
        let schedule = schedule_for(&validators, sprints);
        let verifier = ConsensusVerifier::new(schedule.clone()).with_recent_window(5);
        let genesis = genesis_header();

        // Nothing before block 1 is read, so a chain without genesis suffices
        let mut first = BranchBuilder::new(&schedule, &validators, &genesis);
        let header = first.push_by(2).clone();
        assert_eq!(verifier.author_of(&header, &empty_chain()), Ok(validators[2].address()));

        let mut branch = BranchBuilder::new(&schedule, &validators, &genesis);
        branch.push_by(0);
        branch.extend_by(1, 14);
        let chain = chain_of(branch.headers());
        let tip = branch.tip().clone();

        // Height 16 is sprint 2; sprint 2 - 5 saturates to 0 and the walk ends at block 1
        let mut next = BranchBuilder::new(&schedule, &validators, &tip);
        let header = next.push_by(0).clone();
        assert_eq!(
            verifier.author_of(&header, &chain),
            Err(VerifyError::UnauthorizedSlot {
                signer: validators[0].address(),
                number: 16,
                reason: SlotRejection::RecentlySigned { block: 1 },
            })
        );

        let mut next = BranchBuilder::new(&schedule, &validators, &tip);
        let header = next.push_by(2).clone();
        assert_eq!(verifier.author_of(&header, &chain), Ok(validators[2].address()));
    }

    #[test]
    fn test_primary_produces_whole_sprint() {
        let validators = test_validators(2);
        let schedule = schedule_for(&validators, SprintTable::fixed(8).unwrap());
        let verifier = ConsensusVerifier::new(schedule.clone()).with_recent_window(1);
        let genesis = genesis_header();

        let mut branch = BranchBuilder::new(&schedule, &validators, &genesis);
        branch.extend_primary(31);
        let results = verifier.verify_batch(branch.headers(), &chain_of(&[genesis]));

        for (header, result) in branch.headers().iter().zip(&results) {
            assert_eq!(result, &Ok(schedule.primary(header.number)), "block {}", header.number);
        }
    }

    #[test]
    fn test_wrong_difficulty() {
        let validators = test_validators(3);
        let schedule = schedule_for(&validators, SprintTable::fixed(1).unwrap());
        let verifier = ConsensusVerifier::new(schedule.clone());
        let genesis = genesis_header();

        let mut branch = BranchBuilder::new(&schedule, &validators, &genesis);
        let header = branch.push_with_difficulty(1, 1).clone();
        assert_eq!(
            verifier.verify_header(&header, &chain_of(&[genesis])),
            Err(VerifyError::WrongDifficulty { number: 1, expected: 3, actual: 1 })
        );
    }

    #[test]
    fn test_unknown_ancestor() {
        let validators = test_validators(2);
        let schedule = schedule_for(&validators, SprintTable::fixed(1).unwrap());
        let verifier = ConsensusVerifier::new(schedule.clone());
        let genesis = genesis_header();

        let mut branch = BranchBuilder::new(&schedule, &validators, &genesis);
        branch.extend_primary(3);
        let tip = branch.tip().clone();

        assert_eq!(
            verifier.author_of(&tip, &empty_chain()),
            Err(VerifyError::UnknownAncestor { hash: tip.parent_hash, number: 3 })
        );
    }

    #[test]
    fn test_update_schedule_swaps_snapshot() {
        let validators = test_validators(2);
        let schedule = schedule_for(&validators, SprintTable::fixed(1).unwrap());
        let verifier = ConsensusVerifier::new(schedule.clone());
        let genesis = genesis_header();

        let held = verifier.schedule();
        let replacement = ValidatorSet::new(vec![validators[1].address()])
            .unwrap()
            .with_version(1);
        verifier.update_schedule(schedule.with_epoch(1, replacement).unwrap());

        // Old snapshot unchanged, new one in force
        assert_eq!(held.validators_at(1).version(), 0);
        assert_eq!(verifier.schedule().validators_at(1).version(), 1);

        let mut branch = BranchBuilder::new(&schedule, &validators, &genesis);
        let header = branch.push_by(0).clone();
        assert_eq!(
            verifier.author_of(&header, &chain_of(&[genesis])),
            Err(VerifyError::UnknownSigner { signer: validators[0].address(), number: 1 })
        );
    }

    #[test]
    fn test_verify_batch_preserves_order() {
        let validators = test_validators(3);
        let schedule = schedule_for(&validators, SprintTable::fixed(1).unwrap());
        let verifier = ConsensusVerifier::new(schedule.clone());
        let genesis = genesis_header();

        let mut branch = BranchBuilder::new(&schedule, &validators, &genesis);
        branch.extend_primary(4);
        branch.push_with_difficulty(0, 99);
        let headers = branch.into_headers();

        let results = verifier.verify_batch(&headers, &chain_of(&[genesis]));
        assert_eq!(results.len(), 5);
        for (header, result) in headers.iter().zip(&results).take(4) {
            assert_eq!(result, &Ok(schedule.primary(header.number)));
        }
        assert!(matches!(results[4], Err(VerifyError::WrongDifficulty { number: 5, .. })));
    }
}
