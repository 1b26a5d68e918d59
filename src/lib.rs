//! Sprint-based leader rotation and reorg-aware head tracking for a
//! delegated proof-of-authority chain.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         sprint-poa                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  ┌─────────────────┐        ┌──────────────────┐                    │
//! │  │   ChainConfig   │───────▶│  LeaderSchedule  │                    │
//! │  │ (sprints, set)  │        │ (SprintTable +   │                    │
//! │  └─────────────────┘        │  ValidatorSet)   │                    │
//! │                             └────────┬─────────┘                    │
//! │                                      │                              │
//! │   headers ──▶ ┌───────────────┐  ┌───▼───────────────┐              │
//! │               │ BlockImporter │─▶│ ConsensusVerifier │              │
//! │               └───────┬───────┘  └───────────────────┘              │
//! │                       │                                             │
//! │               ┌───────▼──────────┐    ┌──────────────┐              │
//! │               │ ChainHeadTracker │───▶│ ReorgEvent   │──▶ subscribers│
//! │               │ (HeaderTree +    │    │ fan-out      │              │
//! │               │  fork choice)    │    └──────────────┘              │
//! │               └──────────────────┘                                  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`primitives`]: Header and seal layout
//! - [`consensus`]: Schedule, verification, fork choice and head tracking
//! - [`simulation`]: Deterministic validators and branch building for tests and demos
//! - [`logging`]: Tracing subscriber setup for the binaries

#![warn(unused_crate_dependencies)]

pub mod consensus;
pub mod logging;
pub mod primitives;
pub mod simulation;

// Re-export header primitives
pub use primitives::{Header, SealedHeader, EXTRA_SEAL, EXTRA_VANITY};

// Re-export schedule types
pub use consensus::{
    ChainConfig, ConfigError, LeaderSchedule, ScheduleError, SprintConfigError, SprintTable,
    ValidatorSet,
};

// Re-export verification and tracking types
pub use consensus::{
    BlockImportError, BlockImporter, ChainHeadTracker, ConsensusVerifier, HeadInfo,
    ImportOutcome, ReorgEvent, ReorgSubscription, SubscriptionHandle, TrackerConfig, VerifyError,
};
