//! Header sealing and signer recovery.
//!
//! Headers are signed with secp256k1 ECDSA recoverable signatures (65 bytes)
//! over the header's seal hash. The signer's identity is the Ethereum-style
//! address: the last 20 bytes of keccak256 of the uncompressed public key.
//!
//! Recovery sits behind [`SealRecovery`] so the verifier can be driven by a
//! different signature scheme, or by a stub in tests.

use crate::primitives::{Header, EXTRA_SEAL, EXTRA_VANITY};
use alloy_primitives::{keccak256, Address, Bytes, B256};
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use std::fmt;

/// Seal parsing and recovery errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SealError {
    /// Extra-data too short to carry vanity and seal.
    #[error("extra-data {EXTRA_SEAL} byte seal suffix missing (len {len})")]
    MissingSeal {
        /// Length of the extra-data field.
        len: usize,
    },

    /// Recovery id byte is not 0, 1, 27 or 28.
    #[error("invalid recovery id {0}")]
    InvalidRecoveryId(u8),

    /// The signature does not recover to a public key.
    #[error("signature recovery failed: {0}")]
    Recovery(String),
}

/// Maps a sealed header to the identity that produced the seal.
pub trait SealRecovery: Send + Sync {
    /// Recover the signer address of `header`.
    fn recover_signer(&self, header: &Header) -> Result<Address, SealError>;
}

/// secp256k1 ECDSA seal recovery.
pub struct Secp256k1Recovery {
    secp: Secp256k1<All>,
}

impl Secp256k1Recovery {
    /// Create a new recovery context.
    pub fn new() -> Self {
        Self { secp: Secp256k1::new() }
    }
}

impl Default for Secp256k1Recovery {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Secp256k1Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secp256k1Recovery").finish_non_exhaustive()
    }
}

impl SealRecovery for Secp256k1Recovery {
    fn recover_signer(&self, header: &Header) -> Result<Address, SealError> {
        let signature = header.seal().ok_or(SealError::MissingSeal {
            len: header.extra_data.len(),
        })?;

        // Accept both 0/1 and 27/28 recovery ids
        let v = signature[64];
        let id = if v >= 27 { v - 27 } else { v };
        let recovery_id =
            RecoveryId::try_from(i32::from(id)).map_err(|_| SealError::InvalidRecoveryId(v))?;

        let sig = RecoverableSignature::from_compact(&signature[..64], recovery_id)
            .map_err(|e| SealError::Recovery(e.to_string()))?;

        let message = Message::from_digest(header.seal_hash().0);
        let pubkey = self
            .secp
            .recover_ecdsa(&message, &sig)
            .map_err(|e| SealError::Recovery(e.to_string()))?;

        Ok(public_key_to_address(&pubkey))
    }
}

/// Derive the address of a public key.
pub fn public_key_to_address(pubkey: &PublicKey) -> Address {
    let bytes = pubkey.serialize_uncompressed();
    // Skip the 0x04 prefix
    let hash = keccak256(&bytes[1..]);
    Address::from_slice(&hash[12..])
}

/// Derive the address controlled by a secret key.
pub fn secret_key_to_address(secret_key: &SecretKey) -> Address {
    let secp = Secp256k1::signing_only();
    public_key_to_address(&PublicKey::from_secret_key(&secp, secret_key))
}

/// Seal a header with `secret_key`.
///
/// The first [`EXTRA_VANITY`] bytes of `extra_data` are kept (zero padded if
/// shorter), anything after them is replaced by the seal.
pub fn seal_header(mut header: Header, secret_key: &SecretKey) -> Header {
    let mut vanity = [0u8; EXTRA_VANITY];
    let existing = header.vanity();
    let keep = existing.len().min(EXTRA_VANITY);
    vanity[..keep].copy_from_slice(&existing[..keep]);
    header.extra_data = Bytes::copy_from_slice(&vanity);

    let seal_hash: B256 = header.seal_hash();
    let secp = Secp256k1::signing_only();
    let sig = secp.sign_ecdsa_recoverable(&Message::from_digest(seal_hash.0), secret_key);
    let (recovery_id, compact) = sig.serialize_compact();

    let mut extra = Vec::with_capacity(EXTRA_VANITY + EXTRA_SEAL);
    extra.extend_from_slice(&vanity);
    extra.extend_from_slice(&compact);
    extra.push(i32::from(recovery_id) as u8);
    header.extra_data = extra.into();
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_header(number: u64) -> Header {
        Header {
            parent_hash: B256::repeat_byte(0x42),
            number,
            timestamp: 100 + number,
            difficulty: 2,
            extra_data: Bytes::from_static(b"vanity"),
        }
    }

    #[test]
    fn test_seal_and_recover() {
        let key = SecretKey::from_slice(&[1u8; 32]).unwrap();
        let sealed = seal_header(test_header(1), &key);

        assert!(sealed.is_sealed());
        assert_eq!(sealed.extra_data.len(), EXTRA_VANITY + EXTRA_SEAL);
        assert_eq!(&sealed.vanity()[..6], b"vanity");

        let recovery = Secp256k1Recovery::new();
        let signer = recovery.recover_signer(&sealed).unwrap();
        assert_eq!(signer, secret_key_to_address(&key));
    }

    #[test]
    fn test_different_keys_recover_differently() {
        let key1 = SecretKey::from_slice(&[1u8; 32]).unwrap();
        let key2 = SecretKey::from_slice(&[2u8; 32]).unwrap();
        let recovery = Secp256k1Recovery::new();

        let a = recovery.recover_signer(&seal_header(test_header(3), &key1)).unwrap();
        let b = recovery.recover_signer(&seal_header(test_header(3), &key2)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_header_recovers_other_address() {
        let key = SecretKey::from_slice(&[3u8; 32]).unwrap();
        let mut sealed = seal_header(test_header(5), &key);
        sealed.difficulty = 1;

        let recovery = Secp256k1Recovery::new();
        // Either a different address or a failed recovery, never the signer
        match recovery.recover_signer(&sealed) {
            Ok(addr) => assert_ne!(addr, secret_key_to_address(&key)),
            Err(err) => assert!(matches!(err, SealError::Recovery(_))),
        }
    }

    #[test]
    fn test_missing_seal() {
        let recovery = Secp256k1Recovery::new();
        let result = recovery.recover_signer(&test_header(1));
        assert!(matches!(result, Err(SealError::MissingSeal { len: 6 })));
    }

    #[test]
    fn test_invalid_recovery_id() {
        let key = SecretKey::from_slice(&[4u8; 32]).unwrap();
        let sealed = seal_header(test_header(2), &key);
        let mut extra = sealed.extra_data.to_vec();
        extra[EXTRA_VANITY + 64] = 9;

        let header = Header { extra_data: extra.into(), ..sealed };
        let result = Secp256k1Recovery::new().recover_signer(&header);
        assert!(matches!(result, Err(SealError::InvalidRecoveryId(9))));
    }
}
