//! Primitive types shared by the scheduler and the head tracker.
//!
//! # Modules
//!
//! - [`header`]: Block header, sealed header and the extra-data seal layout

pub mod header;

pub use header::{Header, SealedHeader, EXTRA_SEAL, EXTRA_VANITY};
