//! Block header primitives.
//!
//! Only the fields the scheduler and the head tracker read are modelled. The
//! block body, state root and receipts belong to the execution layer.
//!
//! # Header Layout
//!
//! ```text
//! Header
//! ├── parent_hash: B256
//! ├── number: u64
//! ├── timestamp: u64
//! ├── difficulty: u64        producer priority for this height
//! └── extra_data: Bytes
//!     ├── [0..32]            vanity
//!     └── [32..97]           seal: r(32) | s(32) | v(1)
//! ```

use alloy_primitives::{keccak256, Bytes, B256};
use alloy_rlp::{Encodable, RlpDecodable, RlpEncodable};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::ops::Deref;

/// Fixed number of extra-data prefix bytes reserved for signer vanity.
pub const EXTRA_VANITY: usize = 32;

/// Fixed number of extra-data suffix bytes reserved for the signer seal.
pub const EXTRA_SEAL: usize = 65;

/// A block header as seen by consensus.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// Hash of the parent header.
    pub parent_hash: B256,
    /// Block height.
    pub number: u64,
    /// Production time (UNIX seconds).
    pub timestamp: u64,
    /// Producer priority for this height (primary = validator count).
    pub difficulty: u64,
    /// Vanity prefix followed by the seal.
    pub extra_data: Bytes,
}

impl Header {
    /// Compute the header hash (keccak256 over the RLP encoding, seal included).
    pub fn hash_slow(&self) -> B256 {
        let mut buf = Vec::with_capacity(self.length());
        self.encode(&mut buf);
        keccak256(&buf)
    }

    /// Compute the hash the producer signs: the header with the seal stripped.
    pub fn seal_hash(&self) -> B256 {
        let mut unsealed = self.clone();
        if unsealed.is_sealed() {
            unsealed.extra_data = self.vanity().to_vec().into();
        }
        unsealed.hash_slow()
    }

    /// Whether `extra_data` is long enough to carry vanity and seal.
    pub fn is_sealed(&self) -> bool {
        self.extra_data.len() >= EXTRA_VANITY + EXTRA_SEAL
    }

    /// Everything in `extra_data` before the seal.
    pub fn vanity(&self) -> &[u8] {
        if self.is_sealed() {
            &self.extra_data[..self.extra_data.len() - EXTRA_SEAL]
        } else {
            &self.extra_data
        }
    }

    /// The 65-byte seal, if present.
    pub fn seal(&self) -> Option<&[u8]> {
        self.is_sealed()
            .then(|| &self.extra_data[self.extra_data.len() - EXTRA_SEAL..])
    }

    /// Hash the header once and keep the result alongside it.
    pub fn seal_slow(self) -> SealedHeader {
        let hash = self.hash_slow();
        SealedHeader { header: self, hash }
    }
}

/// A header paired with its cached hash.
///
/// Deserializing recomputes the hash; a serialized hash that disagrees with
/// the header is an error and a missing one is filled in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SealedHeader {
    header: Header,
    hash: B256,
}

impl SealedHeader {
    /// Hash of the header.
    pub fn hash(&self) -> B256 {
        self.hash
    }

    /// Borrow the inner header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Consume and return the inner header.
    pub fn into_header(self) -> Header {
        self.header
    }
}

impl Deref for SealedHeader {
    type Target = Header;

    fn deref(&self) -> &Self::Target {
        &self.header
    }
}

impl From<Header> for SealedHeader {
    fn from(header: Header) -> Self {
        header.seal_slow()
    }
}

impl<'de> Deserialize<'de> for SealedHeader {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Repr {
            header: Header,
            #[serde(default)]
            hash: Option<B256>,
        }

        let Repr { header, hash } = Repr::deserialize(deserializer)?;
        let sealed = header.seal_slow();
        match hash {
            Some(hash) if hash != sealed.hash => Err(de::Error::custom(format!(
                "header hash mismatch: got {hash}, computed {}",
                sealed.hash
            ))),
            _ => Ok(sealed),
        }
    }
}
