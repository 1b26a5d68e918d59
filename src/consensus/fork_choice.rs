//! Fork choice between competing branches.
//!
//! Two branches are compared from their common ancestor:
//! 1. the branch with more headers wins;
//! 2. on equal length, higher cumulative difficulty wins;
//! 3. on equal difficulty, the lower tip hash wins.
//!
//! # Fork Choice Decision
//!
//! When a new header arrives, three outcomes are possible:
//! - **Extend**: the header extends the canonical head
//! - **Reorg**: the header's branch beats the canonical branch
//! - **Keep**: the header's branch loses; retain it as a side branch

use super::block_tree::{HeaderTree, TreeError};
use crate::primitives::SealedHeader;
use alloy_primitives::B256;
use std::cmp::Ordering;

/// Maximum reorg depth allowed.
/// Reorgs deeper than this are rejected.
pub const MAX_REORG_DEPTH: u64 = 64;

/// Fork choice decision result.
#[derive(Debug, Clone)]
pub enum ForkChoiceDecision {
    /// Header extends the canonical head.
    Extend {
        /// The new header's hash.
        block: B256,
    },

    /// Switch to the header's branch.
    Reorg {
        /// Last header shared by both branches.
        common_ancestor: SealedHeader,
        /// Former canonical headers, newest first.
        removed: Vec<SealedHeader>,
        /// New canonical headers, oldest first.
        added: Vec<SealedHeader>,
        /// New head hash.
        new_head: B256,
    },

    /// Header's branch loses; keep it for a potential future reorg.
    Keep {
        /// The header's hash.
        block: B256,
    },
}

/// Error type for fork choice operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForkChoiceError {
    /// Header tree error.
    #[error("header tree error: {0}")]
    Tree(#[from] TreeError),

    /// Branches do not meet within retained history.
    #[error("no common ancestor between head {head} and {block} in retained history")]
    NoCommonAncestor {
        /// Canonical head.
        head: B256,
        /// Competing tip.
        block: B256,
    },

    /// The branch point is too far below the head.
    #[error("reorg depth {depth} exceeds maximum {max}")]
    ReorgDepthExceeded {
        /// Head number minus ancestor number.
        depth: u64,
        /// Configured limit.
        max: u64,
    },
}

/// Weight of a branch measured from a common ancestor.
///
/// Ordered so that the stronger branch compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchWeight {
    /// Headers after the ancestor.
    pub length: u64,
    /// Sum of their difficulties.
    pub difficulty: u128,
    /// Branch tip.
    pub tip: B256,
}

impl Ord for BranchWeight {
    fn cmp(&self, other: &Self) -> Ordering {
        self.length
            .cmp(&other.length)
            .then(self.difficulty.cmp(&other.difficulty))
            // Lower hash is stronger
            .then(other.tip.cmp(&self.tip))
    }
}

impl PartialOrd for BranchWeight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Length-then-difficulty fork choice.
///
/// Stateless: all state lives in the [`HeaderTree`].
#[derive(Debug, Clone, Copy)]
pub struct SprintForkChoice {
    max_reorg_depth: u64,
}

impl Default for SprintForkChoice {
    fn default() -> Self {
        Self::new(MAX_REORG_DEPTH)
    }
}

impl SprintForkChoice {
    /// Create a fork choice rejecting reorgs deeper than `max_reorg_depth`.
    pub fn new(max_reorg_depth: u64) -> Self {
        Self { max_reorg_depth }
    }

    /// Configured depth limit.
    pub fn max_reorg_depth(&self) -> u64 {
        self.max_reorg_depth
    }

    /// Weight of the branch after `ancestor` ending at `tip`.
    pub fn weigh(
        &self,
        tree: &HeaderTree,
        ancestor: &SealedHeader,
        tip: &SealedHeader,
    ) -> BranchWeight {
        BranchWeight {
            length: tip.number - ancestor.number,
            difficulty: tree.difficulty_from(ancestor.hash(), tip.hash()),
            tip: tip.hash(),
        }
    }

    /// Decide what `new_block` (already inserted in `tree`) does to the head.
    pub fn evaluate(
        &self,
        tree: &HeaderTree,
        new_block: &SealedHeader,
    ) -> Result<ForkChoiceDecision, ForkChoiceError> {
        let new_hash = new_block.hash();
        let head = tree.head();
        let head_hash = head.hash();

        if new_block.parent_hash == head_hash {
            return Ok(ForkChoiceDecision::Extend { block: new_hash });
        }

        let ancestor_hash = tree
            .common_ancestor(head_hash, new_hash)
            .ok_or(ForkChoiceError::NoCommonAncestor { head: head_hash, block: new_hash })?;
        let ancestor = tree.get(&ancestor_hash).ok_or(TreeError::UnknownHeader(ancestor_hash))?;

        // Descends from the head through retained side headers
        if ancestor_hash == head_hash {
            return Ok(ForkChoiceDecision::Extend { block: new_hash });
        }

        let depth = head.number - ancestor.number;
        if depth > self.max_reorg_depth {
            return Err(ForkChoiceError::ReorgDepthExceeded { depth, max: self.max_reorg_depth });
        }

        let current = self.weigh(tree, ancestor, head);
        let candidate = self.weigh(tree, ancestor, new_block);

        if candidate > current {
            let mut removed = tree.branch(ancestor_hash, head_hash);
            removed.reverse();
            let added = tree.branch(ancestor_hash, new_hash);

            Ok(ForkChoiceDecision::Reorg {
                common_ancestor: ancestor.clone(),
                removed,
                added,
                new_head: new_hash,
            })
        } else {
            Ok(ForkChoiceDecision::Keep { block: new_hash })
        }
    }
}
