//! Sprint-based POA (Proof of Authority) consensus.
//!
//! Producers rotate per sprint, a run of consecutive blocks, rather than
//! per block:
//!
//! # Algorithm
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   POA Sprint Rotation                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  Validators: [V0, V1, V2]      Sprints: {0: 4, 8: 2}        │
//! │                                                             │
//! │  Blocks 0-3   sprint 0 → V0 (difficulty=3)                  │
//! │  Blocks 4-7   sprint 1 → V1                                 │
//! │  Blocks 8-9   sprint 2 → V2   (length changes, rotation     │
//! │  Blocks 10-11 sprint 3 → V0    continues)                   │
//! │  ...                                                        │
//! │                                                             │
//! │  If V1 misses sprint 1:                                     │
//! │  - V2 may produce with difficulty=2 (first backup)          │
//! │  - V0 may produce with difficulty=1 (second backup)         │
//! │  - A producer that signed in the last sprints is refused    │
//! │  - Chain follows longest branch, then highest difficulty    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`SprintTable`]: sprint lengths by starting height
//! - [`LeaderSchedule`]: producer order and expected difficulty per height
//! - [`ConsensusVerifier`]: recovers and authorizes header producers
//! - [`ChainHeadTracker`]: follows the canonical head across reorgs
//! - [`BlockImporter`]: verification in front of the tracker

pub mod block_tree;
pub mod config;
pub mod fork_choice;
pub mod head_tracker;
pub mod import;
pub mod schedule;
pub mod seal;
pub mod sprint;
pub mod subscription;
pub mod verifier;

pub use config::{ChainConfig, ConfigError, ValidatorSet, ValidatorSetError};
pub use schedule::{LeaderSchedule, ScheduleError};
pub use seal::{seal_header, SealError, SealRecovery, Secp256k1Recovery};
pub use sprint::{SprintConfigError, SprintRegime, SprintTable};
pub use verifier::{ConsensusVerifier, HeaderReader, SlotRejection, VerifyError};

// Head tracking
pub use block_tree::{HeaderTree, TreeError, DEFAULT_RETENTION_DEPTH};
pub use fork_choice::{
    BranchWeight, ForkChoiceDecision, ForkChoiceError, SprintForkChoice, MAX_REORG_DEPTH,
};
pub use head_tracker::{
    ChainHeadTracker, HeadInfo, ImportError, ImportOutcome, ReorgEvent, TrackerConfig, WaitError,
};
pub use import::{BlockImportError, BlockImporter};
pub use subscription::{ReorgSubscription, SubscriptionHandle, DEFAULT_EVENT_BUFFER};
