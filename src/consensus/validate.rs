/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signature checks for finalized blocks received outside of a voting round.

use std::collections::HashSet;

use crate::types::block::{Block, BlockSign};

use super::{ConsensusError, ConsensusState};

/// Check that `block` carries the signature of the formulator the rank table expects at its timeout
/// count, followed by signatures of at least a quorum of distinct observers over its [`BlockSign`].
///
/// `state` must be the consensus state of the block's parent.
pub fn validate_block_signatures(
    state: &ConsensusState,
    block: &Block,
) -> Result<(), ConsensusError> {
    let timeout_count = block
        .header
        .timeout_count()
        .ok_or(ConsensusError::InvalidConsensusData)?;
    let top = state.rank_table().top_rank(timeout_count)?;
    if block.header.generator != top.address {
        return Err(ConsensusError::InvalidTopAddress);
    }
    validate_block_certificate(state, block)
}

/// Check that `block` is signed by the formulator named as its generator, followed by signatures of at
/// least a quorum of distinct observers over its [`BlockSign`].
///
/// Unlike [`validate_block_signatures`] this does not depend on the order of the rank table, so `state`
/// may be any state of the chain. A block that passes it was certified by the observer committee.
pub fn validate_block_certificate(
    state: &ConsensusState,
    block: &Block,
) -> Result<(), ConsensusError> {
    let generator = state
        .rank_table()
        .rank(&block.header.generator)
        .ok_or(ConsensusError::InvalidTopAddress)?;

    let (generator_signature, observer_signatures) = block
        .signatures
        .split_first()
        .ok_or(ConsensusError::InvalidSignatureCount {
            got: 0,
            required: state.quorum() + 1,
        })?;

    let header_hash = block.hash();
    match generator_signature.recover(&header_hash) {
        Ok(signer) if signer == generator.public_hash => (),
        _ => return Err(ConsensusError::InvalidTopSignature),
    }

    let sign_hash = BlockSign {
        header_hash,
        generator_signature: *generator_signature,
    }
    .hash();
    let mut signers = HashSet::new();
    for signature in observer_signatures {
        let signer = signature
            .recover(&sign_hash)
            .map_err(|_| ConsensusError::InvalidObserverKey)?;
        if !state.is_observer(&signer) {
            return Err(ConsensusError::InvalidObserverKey);
        }
        signers.insert(signer);
    }

    if signers.len() < state.quorum() {
        return Err(ConsensusError::InvalidSignatureCount {
            got: signers.len(),
            required: state.quorum(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rank_table::{Rank, RankTable};
    use crate::types::basic::{Address, BlockHeight, ChainID, CryptoHash};
    use crate::types::block::Header;
    use crate::types::crypto_primitives::{Keypair, SigningKey};

    fn keypair(byte: u8) -> Keypair {
        Keypair::new(SigningKey::from_bytes(&[byte; 32]))
    }

    struct Fixture {
        state: ConsensusState,
        generator: Keypair,
        observers: Vec<Keypair>,
    }

    fn fixture() -> Fixture {
        let generator = keypair(1);
        let observers: Vec<Keypair> = (10..15).map(keypair).collect();
        let rank_table = RankTable::from_candidates(
            0,
            vec![Rank::new(
                Address::new([1; 20]),
                generator.public_hash(),
                0,
                CryptoHash::default(),
            )],
        )
        .unwrap();
        let state = ConsensusState::new(
            10,
            observers.iter().map(Keypair::public_hash),
            rank_table,
        );
        Fixture {
            state,
            generator,
            observers,
        }
    }

    fn block(fixture: &Fixture, observer_signers: &[usize]) -> Block {
        let header = Header {
            chain_id: ChainID::new(0),
            version: 1,
            height: BlockHeight::new(1),
            prev_hash: CryptoHash::default(),
            body_hash: Block::body_hash(&[], &[], &[]),
            context_hash: CryptoHash::default(),
            timestamp: 1,
            generator: Address::new([1; 20]),
            consensus_data: Header::encode_consensus_data(0),
        };
        let generator_signature = fixture.generator.sign(&header.hash());
        let sign_hash = BlockSign {
            header_hash: header.hash(),
            generator_signature,
        }
        .hash();

        let mut signatures = vec![generator_signature];
        signatures.extend(
            observer_signers
                .iter()
                .map(|index| fixture.observers[*index].sign(&sign_hash)),
        );
        Block {
            header,
            transaction_types: Vec::new(),
            transactions: Vec::new(),
            transaction_signatures: Vec::new(),
            signatures,
        }
    }

    #[test]
    fn quorum_of_observers_is_accepted() {
        let fixture = fixture();
        validate_block_signatures(&fixture.state, &block(&fixture, &[0, 2, 4])).unwrap();
    }

    #[test]
    fn duplicate_observer_signatures_do_not_count_twice() {
        let fixture = fixture();
        assert_eq!(
            validate_block_signatures(&fixture.state, &block(&fixture, &[0, 0, 4])),
            Err(ConsensusError::InvalidSignatureCount {
                got: 2,
                required: 3
            })
        );
    }

    #[test]
    fn wrong_generator_is_rejected() {
        let fixture = fixture();
        let mut forged = block(&fixture, &[0, 1, 2]);
        forged.signatures[0] = keypair(2).sign(&forged.hash());
        assert_eq!(
            validate_block_signatures(&fixture.state, &forged),
            Err(ConsensusError::InvalidTopSignature)
        );

        let mut moved = block(&fixture, &[0, 1, 2]);
        moved.header.generator = Address::new([2; 20]);
        assert_eq!(
            validate_block_signatures(&fixture.state, &moved),
            Err(ConsensusError::InvalidTopAddress)
        );
    }

    #[test]
    fn non_observer_signature_is_rejected() {
        let fixture = fixture();
        let mut outsider = block(&fixture, &[0, 1]);
        let sign_hash = BlockSign {
            header_hash: outsider.hash(),
            generator_signature: outsider.signatures[0],
        }
        .hash();
        outsider.signatures.push(keypair(99).sign(&sign_hash));
        assert_eq!(
            validate_block_signatures(&fixture.state, &outsider),
            Err(ConsensusError::InvalidObserverKey)
        );
    }

    #[test]
    fn certificate_ignores_rank_order() {
        let mut fixture = fixture();
        let second = keypair(2);
        let mut rank_table = RankTable::from_candidates(
            0,
            vec![
                Rank::new(Address::new([1; 20]), fixture.generator.public_hash(), 0, CryptoHash::default()),
                Rank::new(Address::new([2; 20]), second.public_hash(), 0, CryptoHash::default()),
            ],
        )
        .unwrap();
        rank_table.forward_candidates(2).unwrap();
        fixture.state = ConsensusState::new(
            10,
            fixture.observers.iter().map(Keypair::public_hash),
            rank_table,
        );

        let certified = block(&fixture, &[1, 2, 3]);
        validate_block_certificate(&fixture.state, &certified).unwrap();

        let mut unsigned = certified.clone();
        unsigned.signatures.clear();
        assert_eq!(
            validate_block_certificate(&fixture.state, &unsigned),
            Err(ConsensusError::InvalidSignatureCount {
                got: 0,
                required: 4
            })
        );

        let mut stranger = certified;
        stranger.header.generator = Address::new([3; 20]);
        assert_eq!(
            validate_block_certificate(&fixture.state, &stranger),
            Err(ConsensusError::InvalidTopAddress)
        );
    }
}
