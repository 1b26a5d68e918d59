//! Header import pipeline.
//!
//! Verification runs without touching tracker state (in parallel for
//! batches); only the final import goes through the tracker's serialized
//! entry point.

use super::{
    head_tracker::{ChainHeadTracker, ImportError, ImportOutcome},
    seal::{SealRecovery, Secp256k1Recovery},
    verifier::{ConsensusVerifier, VerifyError},
};
use crate::primitives::SealedHeader;
use alloy_primitives::{Address, B256};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, Span};

/// Per-header import failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockImportError {
    /// Producer verification failed.
    #[error("header {hash} failed verification: {source}")]
    Verify {
        /// Header hash.
        hash: B256,
        /// Cause.
        #[source]
        source: VerifyError,
    },

    /// The tracker refused the header.
    #[error("header {hash} failed import: {source}")]
    Import {
        /// Header hash.
        hash: B256,
        /// Cause.
        #[source]
        source: ImportError,
    },
}

impl BlockImportError {
    /// Hash of the failed header.
    pub fn hash(&self) -> B256 {
        match self {
            Self::Verify { hash, .. } | Self::Import { hash, .. } => *hash,
        }
    }
}

/// Verifies headers and feeds them to the head tracker.
#[derive(Debug)]
pub struct BlockImporter<R = Secp256k1Recovery> {
    verifier: Arc<ConsensusVerifier<R>>,
    tracker: Arc<ChainHeadTracker>,
    span: Span,
}

impl<R: SealRecovery> BlockImporter<R> {
    /// Create an importer over a shared verifier and tracker.
    pub fn new(verifier: Arc<ConsensusVerifier<R>>, tracker: Arc<ChainHeadTracker>) -> Self {
        Self { verifier, tracker, span: Span::none() }
    }

    /// Attach the span import events are recorded under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// The verifier.
    pub fn verifier(&self) -> &Arc<ConsensusVerifier<R>> {
        &self.verifier
    }

    /// The head tracker.
    pub fn tracker(&self) -> &Arc<ChainHeadTracker> {
        &self.tracker
    }

    /// Verify and import a single header.
    pub fn import_header(&self, header: SealedHeader) -> Result<ImportOutcome, BlockImportError> {
        let hash = header.hash();
        if self.tracker.contains(&hash) {
            let canonical = self.tracker.is_canonical(&hash);
            return Ok(ImportOutcome::AlreadyKnown { canonical });
        }

        let signer = self
            .verifier
            .verify_header(&header, self.tracker.as_ref())
            .map_err(|source| BlockImportError::Verify { hash, source })?;
        debug!(
            target: "poa::import",
            parent: &self.span,
            number = header.number,
            %hash,
            %signer,
            "Header verified"
        );

        self.tracker.import(header).map_err(|source| BlockImportError::Import { hash, source })
    }

    /// Verify `headers` in parallel, then import them in order.
    ///
    /// A failed header does not stop the rest of the batch.
    pub fn import_batch(
        &self,
        headers: Vec<SealedHeader>,
    ) -> Vec<Result<ImportOutcome, BlockImportError>> {
        let mut seen = HashSet::new();
        let fresh: Vec<SealedHeader> = headers
            .iter()
            .filter(|h| !self.tracker.contains(&h.hash()) && seen.insert(h.hash()))
            .cloned()
            .collect();
        let verdicts: HashMap<B256, Result<Address, VerifyError>> = fresh
            .iter()
            .map(SealedHeader::hash)
            .zip(self.verifier.verify_batch(&fresh, self.tracker.as_ref()))
            .collect();

        let mut imported = 0usize;
        let results: Vec<_> = headers
            .into_iter()
            .map(|header| {
                let hash = header.hash();
                if self.tracker.contains(&hash) {
                    return Ok(ImportOutcome::AlreadyKnown {
                        canonical: self.tracker.is_canonical(&hash),
                    });
                }
                let verdict = match verdicts.get(&hash) {
                    Some(verdict) => verdict.clone(),
                    // Known when the batch started but pruned since
                    None => self.verifier.verify_header(&header, self.tracker.as_ref()),
                };
                if let Err(source) = verdict {
                    return Err(BlockImportError::Verify { hash, source });
                }
                let outcome = self
                    .tracker
                    .import(header)
                    .map_err(|source| BlockImportError::Import { hash, source })?;
                imported += 1;
                Ok(outcome)
            })
            .collect();

        debug!(
            target: "poa::import",
            parent: &self.span,
            total = results.len(),
            imported,
            head = self.tracker.head_info().number,
            "Batch imported"
        );
        results
    }
}
