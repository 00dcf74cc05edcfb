/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.
//!
//! The definitions and re-exports in this module provide two categories of cryptographic primitives:
//! 1. **Cryptographic Hashes**: SHA-256, provided by the [`sha2`] crate. Structured values are hashed
//!    over their borsh encoding with [`hash`].
//! 2. **Recoverable Signatures**: Ed25519, provided by the [`ed25519_dalek`] crate. Ed25519 does not
//!    support public key recovery natively, so a [`RecoverableSignature`] carries the signer's verifying
//!    key next to the signature. "Recovering" checks the signature against that key and yields the
//!    key's [`PublicHash`].

use std::io;

use borsh::{BorshDeserialize, BorshSerialize};

use super::basic::{CryptoHash, PublicHash};

// re-exports below.
pub use sha2::Digest;
pub use sha2::Sha256 as CryptoHasher;

pub use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};

/// A facade around [`SigningKey`] that signs content hashes and knows its own [`PublicHash`].
#[derive(Clone)]
pub struct Keypair(pub(crate) SigningKey);

impl Keypair {
    /// Create a `Keypair` that wraps over `signing_key`.
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Sign a content hash.
    pub fn sign(&self, hash: &CryptoHash) -> RecoverableSignature {
        RecoverableSignature {
            public_key: self.0.verifying_key().to_bytes(),
            signature: self.0.sign(hash.as_bytes()).to_bytes(),
        }
    }

    /// Get the `VerifyingKey` of this `Keypair`.
    pub fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }

    /// Get the hash of this keypair's public key.
    pub fn public_hash(&self) -> PublicHash {
        public_hash(&self.0.verifying_key())
    }
}

/// An Ed25519 signature together with the verifying key that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RecoverableSignature {
    public_key: [u8; 32],
    signature: [u8; 64],
}

impl RecoverableSignature {
    /// Verify this signature over `hash` and return the public hash of the signer.
    pub fn recover(&self, hash: &CryptoHash) -> Result<PublicHash, SignatureError> {
        let verifying_key = VerifyingKey::from_bytes(&self.public_key)?;
        let signature = Signature::from_bytes(&self.signature);
        verifying_key.verify(hash.as_bytes(), &signature)?;
        Ok(public_hash(&verifying_key))
    }
}

/// `SHA-256(verifying_key)`.
pub fn public_hash(verifying_key: &VerifyingKey) -> PublicHash {
    let mut hasher = CryptoHasher::new();
    hasher.update(verifying_key.as_bytes());
    PublicHash::new(hasher.finalize().into())
}

/// SHA-256 over the borsh encoding of `value`.
pub fn hash<T: BorshSerialize>(value: &T) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    // Writing into a hasher cannot fail.
    let _ = value.serialize(&mut HashWriter(&mut hasher));
    CryptoHash::new(hasher.finalize().into())
}

/// SHA-256 over raw bytes.
pub fn hash_bytes(bytes: &[u8]) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update(bytes);
    CryptoHash::new(hasher.finalize().into())
}

struct HashWriter<'a>(&'a mut CryptoHasher);

impl io::Write for HashWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn recover_returns_signer_public_hash() {
        let keypair = Keypair::new(SigningKey::generate(&mut OsRng));
        let content = hash(&(1u32, 2u64));
        let signature = keypair.sign(&content);
        assert_eq!(signature.recover(&content).unwrap(), keypair.public_hash());
    }

    #[test]
    fn recover_rejects_other_content() {
        let keypair = Keypair::new(SigningKey::generate(&mut OsRng));
        let signature = keypair.sign(&hash(&1u32));
        assert!(signature.recover(&hash(&2u32)).is_err());
    }

    #[test]
    fn hash_matches_hash_of_encoding() {
        let value = (7u32, [3u8; 4]);
        assert_eq!(hash(&value), hash_bytes(&value.try_to_vec().unwrap()));
    }
}
