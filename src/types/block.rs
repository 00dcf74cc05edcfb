/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the block, header and transaction types and their associated methods.
//!
//! A finalized [`Block`] carries a signature list whose first entry is the generator's signature over
//! the header hash, followed by the signatures of the observers over the [`BlockSign`] tuple.

use borsh::{BorshDeserialize, BorshSerialize};

use super::basic::*;
use super::crypto_primitives::{hash, RecoverableSignature};

/// Application-defined transaction kind.
pub type TxType = u16;

/// A transaction as far as consensus is concerned: a timestamp that places it into a time slot, and
/// an opaque payload interpreted by the [`Committer`](crate::chain::Committer).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn new(timestamp: Timestamp, payload: Vec<u8>) -> Transaction {
        Transaction { timestamp, payload }
    }

    /// The hash that transaction signatures sign, and the key of the transaction in the pool.
    pub fn hash(&self, chain_id: ChainID, tx_type: TxType) -> CryptoHash {
        hash(&(chain_id, tx_type, self))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Header {
    pub chain_id: ChainID,
    pub version: u16,
    pub height: BlockHeight,
    pub prev_hash: CryptoHash,
    pub body_hash: CryptoHash,
    pub context_hash: CryptoHash,
    pub timestamp: Timestamp,
    pub generator: Address,
    pub consensus_data: Vec<u8>,
}

impl Header {
    pub fn hash(&self) -> CryptoHash {
        hash(self)
    }

    /// Decode the timeout count stored in `consensus_data`. Returns `None` if the field is not exactly
    /// four bytes long.
    pub fn timeout_count(&self) -> Option<TimeoutCount> {
        let bytes: [u8; 4] = self.consensus_data.as_slice().try_into().ok()?;
        Some(TimeoutCount::from_le_bytes(bytes))
    }

    pub fn encode_consensus_data(timeout_count: TimeoutCount) -> Vec<u8> {
        timeout_count.to_le_bytes().to_vec()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub header: Header,
    pub transaction_types: Vec<TxType>,
    pub transactions: Vec<Transaction>,
    pub transaction_signatures: Vec<Vec<RecoverableSignature>>,
    /// `[generator_signature, observer_signatures...]`. Empty until the block is finalized.
    pub signatures: Vec<RecoverableSignature>,
}

impl Block {
    pub fn height(&self) -> BlockHeight {
        self.header.height
    }

    pub fn hash(&self) -> CryptoHash {
        self.header.hash()
    }

    /// Hash committing to the transaction list, stored in [`Header::body_hash`].
    pub fn body_hash(
        transaction_types: &[TxType],
        transactions: &[Transaction],
        transaction_signatures: &[Vec<RecoverableSignature>],
    ) -> CryptoHash {
        hash(&(transaction_types, transactions, transaction_signatures))
    }

    /// Checks whether `header.body_hash` matches the transactions carried by the block.
    pub fn is_body_consistent(&self) -> bool {
        self.transactions.len() == self.transaction_types.len()
            && self.transactions.len() == self.transaction_signatures.len()
            && self.header.body_hash
                == Block::body_hash(
                    &self.transaction_types,
                    &self.transactions,
                    &self.transaction_signatures,
                )
    }
}

/// The tuple an observer co-signs. Signing the generator signature along with the header hash proves
/// co-signature of one specific generator signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockSign {
    pub header_hash: CryptoHash,
    pub generator_signature: RecoverableSignature,
}

impl BlockSign {
    pub fn hash(&self) -> CryptoHash {
        hash(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Header {
        Header {
            chain_id: ChainID::new(1),
            version: 1,
            height: BlockHeight::new(1),
            prev_hash: CryptoHash::default(),
            body_hash: CryptoHash::default(),
            context_hash: CryptoHash::default(),
            timestamp: 10,
            generator: Address::default(),
            consensus_data: Header::encode_consensus_data(3),
        }
    }

    #[test]
    fn timeout_count_round_trips_through_consensus_data() {
        assert_eq!(header().timeout_count(), Some(3));

        let mut malformed = header();
        malformed.consensus_data = vec![1, 2, 3];
        assert_eq!(malformed.timeout_count(), None);
    }

    #[test]
    fn header_hash_depends_on_every_field() {
        let mut other = header();
        other.timestamp += 1;
        assert_ne!(header().hash(), other.hash());
    }
}
