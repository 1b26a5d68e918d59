//! In-memory header tree for fork tracking.
//!
//! Holds every recent header the node has seen, side branches included, and
//! answers the questions fork choice needs: where two tips meet, what lies
//! between an ancestor and a tip, and how much difficulty a branch carries.
//!
//! The tree is rooted at a single retained header (genesis, or the prune floor
//! once the chain is deeper than the retention depth). Every other header's
//! parent is in the tree.

use crate::primitives::SealedHeader;
use alloy_primitives::B256;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Default number of headers retained below the head.
pub const DEFAULT_RETENTION_DEPTH: u64 = 256;

/// Header tree errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    /// Header is already in the tree.
    #[error("header already known: {0}")]
    AlreadyKnown(B256),

    /// Parent is not in the tree (never seen, or pruned).
    #[error("unknown parent {parent} for block {number}")]
    UnknownParent {
        /// Missing parent hash.
        parent: B256,
        /// Height of the orphan.
        number: u64,
    },

    /// Header number is not parent number + 1.
    #[error("block number {number} does not follow parent number {parent_number}")]
    NonSequentialNumber {
        /// Header number.
        number: u64,
        /// Parent number.
        parent_number: u64,
    },

    /// Header not in the tree.
    #[error("header not found: {0}")]
    UnknownHeader(B256),
}

/// Recent headers and their parent/child links.
#[derive(Debug)]
pub struct HeaderTree {
    /// All known headers indexed by hash.
    headers: HashMap<B256, SealedHeader>,
    /// Hashes by number (several per number when forks exist).
    by_number: BTreeMap<u64, HashSet<B256>>,
    /// Parent to children mapping.
    children: HashMap<B256, HashSet<B256>>,
    canonical_head: B256,
    /// Oldest retained header; every branch descends from it.
    root: B256,
    retention_depth: u64,
}

impl HeaderTree {
    /// Create a tree rooted at `genesis`, which is also the initial head.
    pub fn with_genesis(genesis: SealedHeader, retention_depth: u64) -> Self {
        let hash = genesis.hash();
        let mut tree = Self {
            headers: HashMap::new(),
            by_number: BTreeMap::new(),
            children: HashMap::new(),
            canonical_head: hash,
            root: hash,
            retention_depth,
        };
        tree.by_number.entry(genesis.number).or_default().insert(hash);
        tree.headers.insert(hash, genesis);
        tree
    }

    /// Insert a header whose parent is already in the tree.
    pub fn insert(&mut self, header: SealedHeader) -> Result<B256, TreeError> {
        let hash = header.hash();
        if self.headers.contains_key(&hash) {
            return Err(TreeError::AlreadyKnown(hash));
        }

        let parent = self.headers.get(&header.parent_hash).ok_or(TreeError::UnknownParent {
            parent: header.parent_hash,
            number: header.number,
        })?;
        if header.number != parent.number + 1 {
            return Err(TreeError::NonSequentialNumber {
                number: header.number,
                parent_number: parent.number,
            });
        }

        self.children.entry(header.parent_hash).or_default().insert(hash);
        self.by_number.entry(header.number).or_default().insert(hash);
        self.headers.insert(hash, header);
        Ok(hash)
    }

    /// Remove a header that has no children and is neither head nor root.
    pub fn remove_leaf(&mut self, hash: &B256) -> Option<SealedHeader> {
        if *hash == self.canonical_head
            || *hash == self.root
            || self.children.get(hash).is_some_and(|c| !c.is_empty())
        {
            return None;
        }
        let header = self.headers.remove(hash)?;
        if let Some(siblings) = self.children.get_mut(&header.parent_hash) {
            siblings.remove(hash);
            if siblings.is_empty() {
                self.children.remove(&header.parent_hash);
            }
        }
        if let Some(at_number) = self.by_number.get_mut(&header.number) {
            at_number.remove(hash);
            if at_number.is_empty() {
                self.by_number.remove(&header.number);
            }
        }
        Some(header)
    }

    /// Header by hash.
    pub fn get(&self, hash: &B256) -> Option<&SealedHeader> {
        self.headers.get(hash)
    }

    /// Whether the tree holds `hash`.
    pub fn contains(&self, hash: &B256) -> bool {
        self.headers.contains_key(hash)
    }

    /// The canonical head.
    pub fn head(&self) -> &SealedHeader {
        // The head is never pruned
        &self.headers[&self.canonical_head]
    }

    /// Hash of the canonical head.
    pub fn head_hash(&self) -> B256 {
        self.canonical_head
    }

    /// Oldest retained header.
    pub fn root(&self) -> &SealedHeader {
        &self.headers[&self.root]
    }

    /// Make `hash` the canonical head.
    pub fn set_canonical_head(&mut self, hash: B256) -> Result<(), TreeError> {
        if !self.headers.contains_key(&hash) {
            return Err(TreeError::UnknownHeader(hash));
        }
        self.canonical_head = hash;
        Ok(())
    }

    /// Ancestor of `hash` at height `number`, if retained.
    pub fn ancestor_at(&self, hash: B256, number: u64) -> Option<&SealedHeader> {
        let mut current = self.headers.get(&hash)?;
        while current.number > number {
            current = self.headers.get(&current.parent_hash)?;
        }
        (current.number == number).then_some(current)
    }

    /// Most recent common ancestor of `a` and `b`.
    ///
    /// Walks both sides back in lockstep by number. `None` when the walk
    /// leaves retained history before the branches meet.
    pub fn common_ancestor(&self, a: B256, b: B256) -> Option<B256> {
        let mut a = self.headers.get(&a)?;
        let mut b = self.headers.get(&b)?;

        while a.number > b.number {
            a = self.headers.get(&a.parent_hash)?;
        }
        while b.number > a.number {
            b = self.headers.get(&b.parent_hash)?;
        }
        while a.hash() != b.hash() {
            a = self.headers.get(&a.parent_hash)?;
            b = self.headers.get(&b.parent_hash)?;
        }
        Some(a.hash())
    }

    /// Headers after `ancestor` up to and including `tip`, oldest first.
    pub fn branch(&self, ancestor: B256, tip: B256) -> Vec<SealedHeader> {
        let mut chain = Vec::new();
        let mut current = tip;

        while current != ancestor {
            let Some(header) = self.headers.get(&current) else { break };
            chain.push(header.clone());
            current = header.parent_hash;
        }

        chain.reverse();
        chain
    }

    /// Sum of difficulties after `ancestor` up to and including `tip`.
    pub fn difficulty_from(&self, ancestor: B256, tip: B256) -> u128 {
        let mut total = 0u128;
        let mut current = tip;

        while current != ancestor {
            let Some(header) = self.headers.get(&current) else { break };
            total += u128::from(header.difficulty);
            current = header.parent_hash;
        }

        total
    }

    /// Retained canonical chain, root first.
    pub fn canonical_chain(&self) -> Vec<SealedHeader> {
        let mut chain = self.branch(self.root, self.canonical_head);
        chain.insert(0, self.root().clone());
        chain
    }

    /// All headers at `number`.
    pub fn headers_at(&self, number: u64) -> Vec<&SealedHeader> {
        self.by_number
            .get(&number)
            .map(|hashes| hashes.iter().filter_map(|h| self.headers.get(h)).collect())
            .unwrap_or_default()
    }

    /// Drop everything more than `retention_depth` below the head.
    ///
    /// The canonical ancestor at the new floor becomes the root. Side branches
    /// that forked below the floor go with it. Returns the number of headers
    /// removed.
    pub fn prune(&mut self) -> usize {
        let floor = self.head().number.saturating_sub(self.retention_depth);
        if floor <= self.root().number {
            return 0;
        }
        let Some(new_root) = self.ancestor_at(self.canonical_head, floor).map(|h| h.hash())
        else {
            return 0;
        };

        // Everything reachable from the new root survives
        let mut keep = HashSet::with_capacity(self.headers.len());
        let mut queue = VecDeque::from([new_root]);
        while let Some(hash) = queue.pop_front() {
            if keep.insert(hash) {
                if let Some(children) = self.children.get(&hash) {
                    queue.extend(children.iter().copied());
                }
            }
        }

        let before = self.headers.len();
        self.headers.retain(|hash, _| keep.contains(hash));
        self.children.retain(|parent, _| keep.contains(parent));
        self.by_number.retain(|_, hashes| {
            hashes.retain(|h| keep.contains(h));
            !hashes.is_empty()
        });
        self.root = new_root;
        before - self.headers.len()
    }

    /// Number of headers in the tree.
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Never true: the root is always present.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Retention depth.
    pub fn retention_depth(&self) -> u64 {
        self.retention_depth
    }
}
