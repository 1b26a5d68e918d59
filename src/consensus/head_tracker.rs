//! Canonical head tracking with reorg notifications.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     ChainHeadTracker                         │
//! │                                                              │
//! │  import(header)                                              │
//! │     │  write lock held for the whole sequence                │
//! │     ▼                                                        │
//! │  ┌────────────┐   ┌──────────────────┐   ┌────────────────┐  │
//! │  │ HeaderTree │──▶│ SprintForkChoice │──▶│ head + prune   │  │
//! │  └────────────┘   └──────────────────┘   └───────┬────────┘  │
//! │                                                  │           │
//! │                     ReorgEvent ─▶ subscribers ◀──┤           │
//! │                     HeadInfo   ─▶ watch       ◀──┘           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Imports are serialized, so head changes and their events are observed in
//! one total order. Readers take the read lock and never see a half-applied
//! import.

use super::{
    block_tree::{HeaderTree, TreeError, DEFAULT_RETENTION_DEPTH},
    fork_choice::{ForkChoiceDecision, ForkChoiceError, SprintForkChoice, MAX_REORG_DEPTH},
    subscription::{
        ReorgSubscription, SubscriberRegistry, SubscriptionHandle, DEFAULT_EVENT_BUFFER,
    },
    verifier::HeaderReader,
};
use crate::primitives::SealedHeader;
use alloy_primitives::B256;
use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, warn, Span};

/// A canonical chain switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgEvent {
    /// Former canonical headers, from the old head down to just above `common_block`.
    pub removed: Vec<SealedHeader>,
    /// New canonical headers, from just above `common_block` up to the new head.
    pub added: Vec<SealedHeader>,
    /// Last header both branches share.
    pub common_block: SealedHeader,
}

impl ReorgEvent {
    /// Head before the switch.
    pub fn old_head(&self) -> Option<&SealedHeader> {
        self.removed.first()
    }

    /// Head after the switch.
    pub fn new_head(&self) -> Option<&SealedHeader> {
        self.added.last()
    }

    /// Number of headers unwound.
    pub fn depth(&self) -> usize {
        self.removed.len()
    }
}

/// Result of importing a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// The header became the head on top of the previous head.
    Extended,
    /// The header's branch replaced the canonical branch.
    Reorged(Arc<ReorgEvent>),
    /// Kept as a side branch; head unchanged.
    SideChain,
    /// Seen before; nothing changed.
    AlreadyKnown {
        /// Whether the header is on the canonical chain.
        canonical: bool,
    },
}

/// Header import errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImportError {
    /// Header does not fit the tree.
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// Fork choice refused the header.
    #[error(transparent)]
    ForkChoice(#[from] ForkChoiceError),
}

impl ImportError {
    /// Whether the node must resync rather than follow this branch.
    pub fn is_deep_reorg(&self) -> bool {
        matches!(
            self,
            Self::ForkChoice(
                ForkChoiceError::NoCommonAncestor { .. }
                    | ForkChoiceError::ReorgDepthExceeded { .. }
            )
        )
    }
}

/// Head waiting errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// Deadline passed first.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The sending side went away.
    #[error("channel closed")]
    Closed,
}

/// Head position published after every head change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadInfo {
    /// Head number.
    pub number: u64,
    /// Head hash.
    pub hash: B256,
}

impl From<&SealedHeader> for HeadInfo {
    fn from(header: &SealedHeader) -> Self {
        Self { number: header.number, hash: header.hash() }
    }
}

/// Head tracker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Deepest accepted reorg.
    pub max_reorg_depth: u64,
    /// Headers kept below the head.
    pub retention_depth: u64,
    /// Per-subscriber event channel capacity.
    pub event_buffer: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_reorg_depth: MAX_REORG_DEPTH,
            retention_depth: DEFAULT_RETENTION_DEPTH,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl TrackerConfig {
    /// Set the reorg depth limit.
    pub fn with_max_reorg_depth(mut self, depth: u64) -> Self {
        self.max_reorg_depth = depth;
        self
    }

    /// Set the retention depth.
    pub fn with_retention_depth(mut self, depth: u64) -> Self {
        self.retention_depth = depth;
        self
    }

    /// Set the subscriber channel capacity (at least 1).
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }
}

/// Owns the canonical head and notifies subscribers of branch switches.
#[derive(Debug)]
pub struct ChainHeadTracker {
    tree: RwLock<HeaderTree>,
    fork_choice: SprintForkChoice,
    subscribers: Arc<SubscriberRegistry>,
    head_tx: watch::Sender<HeadInfo>,
    config: TrackerConfig,
    span: Span,
}

impl ChainHeadTracker {
    /// Create a tracker whose head starts at `genesis`.
    pub fn new(genesis: SealedHeader, config: TrackerConfig) -> Self {
        let (head_tx, _) = watch::channel(HeadInfo::from(&genesis));
        Self {
            tree: RwLock::new(HeaderTree::with_genesis(genesis, config.retention_depth)),
            fork_choice: SprintForkChoice::new(config.max_reorg_depth),
            subscribers: SubscriberRegistry::new(config.event_buffer, Span::none()),
            head_tx,
            config,
            span: Span::none(),
        }
    }

    /// Attach the span all tracker events are recorded under.
    ///
    /// Call before subscribing; existing subscriptions are dropped.
    pub fn with_span(mut self, span: Span) -> Self {
        self.subscribers = SubscriberRegistry::new(self.config.event_buffer, span.clone());
        self.span = span;
        self
    }

    /// Tracker configuration.
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Import a header whose producer has already been verified.
    pub fn import(&self, header: SealedHeader) -> Result<ImportOutcome, ImportError> {
        let mut tree = self.tree.write();
        let hash = header.hash();

        if tree.contains(&hash) {
            let canonical = Self::is_canonical_in(&tree, &hash);
            debug!(
                target: "poa::tracker",
                parent: &self.span,
                number = header.number,
                %hash,
                canonical,
                "Header already known"
            );
            return Ok(ImportOutcome::AlreadyKnown { canonical });
        }

        if !tree.contains(&header.parent_hash) {
            // A parent at or below the root's height can never be linked back in
            if header.number <= tree.root().number + 1 {
                warn!(
                    target: "poa::tracker",
                    parent: &self.span,
                    number = header.number,
                    %hash,
                    "Fork below retained history"
                );
                let head = tree.head_hash();
                return Err(ForkChoiceError::NoCommonAncestor { head, block: hash }.into());
            }
            let parent = header.parent_hash;
            return Err(TreeError::UnknownParent { parent, number: header.number }.into());
        }

        tree.insert(header.clone())?;
        let decision = match self.fork_choice.evaluate(&tree, &header) {
            Ok(decision) => decision,
            Err(err) => {
                tree.remove_leaf(&hash);
                warn!(
                    target: "poa::tracker",
                    parent: &self.span,
                    number = header.number,
                    %hash,
                    %err,
                    "Fork choice rejected header"
                );
                return Err(err.into());
            }
        };

        match decision {
            ForkChoiceDecision::Extend { block } => {
                tree.set_canonical_head(block)?;
                debug!(
                    target: "poa::tracker",
                    parent: &self.span,
                    number = header.number,
                    hash = %block,
                    "Chain extended"
                );
                self.after_head_change(&mut tree);
                Ok(ImportOutcome::Extended)
            }

            ForkChoiceDecision::Keep { block } => {
                debug!(
                    target: "poa::tracker",
                    parent: &self.span,
                    number = header.number,
                    hash = %block,
                    head = tree.head().number,
                    "Side chain header retained"
                );
                Ok(ImportOutcome::SideChain)
            }

            ForkChoiceDecision::Reorg { common_ancestor, removed, added, new_head } => {
                tree.set_canonical_head(new_head)?;
                let event = Arc::new(ReorgEvent { removed, added, common_block: common_ancestor });
                let delivered = self.subscribers.publish(&event);

                info!(
                    target: "poa::tracker",
                    parent: &self.span,
                    common_ancestor = event.common_block.number,
                    removed = event.removed.len(),
                    added = event.added.len(),
                    new_head = %new_head,
                    new_head_number = header.number,
                    delivered,
                    "Chain reorganized"
                );
                self.after_head_change(&mut tree);
                Ok(ImportOutcome::Reorged(event))
            }
        }
    }

    fn after_head_change(&self, tree: &mut HeaderTree) {
        let pruned = tree.prune();
        if pruned > 0 {
            debug!(
                target: "poa::tracker",
                parent: &self.span,
                pruned,
                root = tree.root().number,
                "Pruned header tree"
            );
        }
        self.head_tx.send_replace(HeadInfo::from(tree.head()));
    }

    fn is_canonical_in(tree: &HeaderTree, hash: &B256) -> bool {
        tree.get(hash)
            .and_then(|header| tree.ancestor_at(tree.head_hash(), header.number))
            .is_some_and(|canonical| canonical.hash() == *hash)
    }

    /// The canonical head.
    pub fn current_head(&self) -> SealedHeader {
        self.tree.read().head().clone()
    }

    /// Number and hash of the canonical head.
    pub fn head_info(&self) -> HeadInfo {
        *self.head_tx.borrow()
    }

    /// Whether `hash` is known (canonical or side chain).
    pub fn contains(&self, hash: &B256) -> bool {
        self.tree.read().contains(hash)
    }

    /// Whether `hash` is on the canonical chain.
    pub fn is_canonical(&self, hash: &B256) -> bool {
        Self::is_canonical_in(&self.tree.read(), hash)
    }

    /// Retained canonical chain, oldest first.
    pub fn canonical_chain(&self) -> Vec<SealedHeader> {
        self.tree.read().canonical_chain()
    }

    /// Number of retained headers, side branches included.
    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    /// Never true: at least the root is retained.
    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }

    /// Register for reorg events.
    pub fn subscribe_reorg_events(&self) -> (ReorgSubscription, SubscriptionHandle) {
        self.subscribers.subscribe()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Observe head changes.
    pub fn watch_head(&self) -> watch::Receiver<HeadInfo> {
        self.head_tx.subscribe()
    }

    /// Wait until the head reaches `number`, at most `timeout`.
    pub async fn wait_for_head(
        &self,
        number: u64,
        timeout: Duration,
    ) -> Result<HeadInfo, WaitError> {
        let mut rx = self.head_tx.subscribe();
        // Copy the head out so the watch guard is released before `rx` goes away
        let reached = tokio::time::timeout(timeout, rx.wait_for(|head| head.number >= number))
            .await
            .map(|waited| waited.map(|head| *head));
        match reached {
            Ok(Ok(head)) => Ok(head),
            Ok(Err(_)) => Err(WaitError::Closed),
            Err(_) => Err(WaitError::Timeout(timeout)),
        }
    }
}

impl HeaderReader for ChainHeadTracker {
    fn header_by_hash(&self, hash: &B256) -> Option<SealedHeader> {
        self.tree.read().get(hash).cloned()
    }
}
