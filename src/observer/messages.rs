/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages exchanged between observers, and between observers and the formulator they elect.
//!
//! Votes between observers are [`Signed`] by their sender, and receivers check that the signer is the
//! observer the message arrived from. The block messages carry their own signatures: the generator's over
//! the header hash, and the observers' over the [`BlockSign`] of the header.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{
    Address, BlockHeight, ChainID, CryptoHash, PublicHash, TimeoutCount, Timestamp,
};
use crate::types::block::{Block, BlockSign, Header};
use crate::types::crypto_primitives::{hash, Keypair, RecoverableSignature, SignatureError};

/// A message body together with its sender's signature over the body's hash.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Signed<T> {
    pub body: T,
    pub signature: RecoverableSignature,
}

impl<T: BorshSerialize> Signed<T> {
    pub fn new(body: T, keypair: &Keypair) -> Signed<T> {
        let signature = keypair.sign(&hash(&body));
        Signed { body, signature }
    }

    /// The public hash of the key that signed the body.
    pub fn signer(&self) -> Result<PublicHash, SignatureError> {
        self.signature.recover(&hash(&self.body))
    }
}

/// An observer's choice of formulator for the blocks starting at `target_height`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RoundVote {
    pub chain_id: ChainID,
    pub last_hash: CryptoHash,
    pub target_height: BlockHeight,
    pub timeout_count: TimeoutCount,
    pub formulator: Address,
    pub formulator_public_hash: PublicHash,
    pub timestamp: Timestamp,
    pub is_reply: bool,
}

/// An observer's commitment to one round vote, which names the formulator and, through `public_hash`, the
/// leader observer of the turn.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RoundVoteAck {
    pub chain_id: ChainID,
    pub last_hash: CryptoHash,
    pub target_height: BlockHeight,
    pub timeout_count: TimeoutCount,
    pub formulator: Address,
    pub formulator_public_hash: PublicHash,
    pub public_hash: PublicHash,
    pub timestamp: Timestamp,
    pub is_reply: bool,
}

impl RoundVoteAck {
    /// Whether two acks elect the same formulator and leader.
    pub fn agrees_with(&self, other: &RoundVoteAck) -> bool {
        self.target_height == other.target_height
            && self.timeout_count == other.timeout_count
            && self.formulator == other.formulator
            && self.public_hash == other.public_hash
    }
}

/// An observer stuck waiting for a block asks its peers for the block they received.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockGenRequest {
    pub chain_id: ChainID,
    pub last_hash: CryptoHash,
    pub target_height: BlockHeight,
    pub timeout_count: TimeoutCount,
    pub formulator: Address,
    pub formulator_public_hash: PublicHash,
    pub public_hash: PublicHash,
    pub timestamp: Timestamp,
}

pub type RoundVoteMessage = Signed<RoundVote>;
pub type RoundVoteAckMessage = Signed<RoundVoteAck>;
pub type BlockGenRequestMessage = Signed<BlockGenRequest>;

/// Sent by the leader observer of a turn to the elected formulator.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockReqMessage {
    pub prev_hash: CryptoHash,
    pub target_height: BlockHeight,
    pub timeout_count: TimeoutCount,
    pub formulator: Address,
    pub formulator_public_hash: PublicHash,
}

/// A proposed block. `block.signatures` is empty: the generator's signature travels next to it.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockGenMessage {
    pub block: Block,
    pub generator_signature: RecoverableSignature,
    pub is_reply: bool,
}

impl BlockGenMessage {
    pub fn block_sign(&self) -> BlockSign {
        BlockSign {
            header_hash: self.block.hash(),
            generator_signature: self.generator_signature,
        }
    }
}

/// An observer's signature over the [`BlockSign`] of a proposed header.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockVoteMessage {
    pub target_height: BlockHeight,
    pub header: Header,
    pub generator_signature: RecoverableSignature,
    pub observer_signature: RecoverableSignature,
    pub is_reply: bool,
}

impl BlockVoteMessage {
    pub fn block_sign(&self) -> BlockSign {
        BlockSign {
            header_hash: self.header.hash(),
            generator_signature: self.generator_signature,
        }
    }

    /// The observer that signed this vote.
    pub fn signer(&self) -> Result<PublicHash, SignatureError> {
        self.observer_signature.recover(&self.block_sign().hash())
    }
}

/// The certificate of a committed block, sent by the leader observer back to the formulator.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockObSignMessage {
    pub target_height: BlockHeight,
    pub block_sign: BlockSign,
    pub observer_signatures: Vec<RecoverableSignature>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::crypto_primitives::SigningKey;

    fn vote() -> RoundVote {
        RoundVote {
            chain_id: ChainID::new(1),
            last_hash: CryptoHash::new([3; 32]),
            target_height: BlockHeight::new(5),
            timeout_count: 0,
            formulator: Address::new([1; 20]),
            formulator_public_hash: PublicHash::new([1; 32]),
            timestamp: 42,
            is_reply: false,
        }
    }

    #[test]
    fn signed_messages_recover_their_sender() {
        let keypair = Keypair::new(SigningKey::from_bytes(&[9; 32]));
        let message = RoundVoteMessage::new(vote(), &keypair);
        assert_eq!(message.signer().unwrap(), keypair.public_hash());
    }

    #[test]
    fn tampered_body_does_not_recover_the_sender() {
        let keypair = Keypair::new(SigningKey::from_bytes(&[9; 32]));
        let mut message = RoundVoteMessage::new(vote(), &keypair);
        message.body.timeout_count = 1;
        assert!(message
            .signer()
            .map_or(true, |signer| signer != keypair.public_hash()));
    }
}
