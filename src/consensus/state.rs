/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The persisted state of Proof-of-Formulator consensus.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::chain::{Committer, Provider};
use crate::rank_table::{RankTable, RankTableBytes};
use crate::types::basic::{PublicHash, TimeoutCount};
use crate::types::block::Header;

use super::ConsensusError;

/// The key that [`ConsensusState`] is stored under through
/// [`Committer::save_process_data`](crate::chain::Committer::save_process_data).
pub const CONSENSUS_STATE_TAG: &[u8] = b"pof.consensus";

/// Everything a node needs to decide who may produce and who may certify the next block.
///
/// The observer set is fixed at genesis. The rank table and the count of consecutive blocks by the top
/// formulator change only through [`apply_block`](Self::apply_block), which every node runs on every
/// connected block.
#[derive(Clone, Debug)]
pub struct ConsensusState {
    max_blocks_per_formulator: u32,
    observer_key_map: BTreeMap<PublicHash, bool>,
    blocks_by_same_formulator: u32,
    rank_table: RankTable,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct PersistedConsensusState {
    max_blocks_per_formulator: u32,
    observer_key_map: BTreeMap<PublicHash, bool>,
    blocks_by_same_formulator: u32,
    rank_table: RankTableBytes,
}

impl ConsensusState {
    /// The genesis state.
    pub fn new(
        max_blocks_per_formulator: u32,
        observers: impl IntoIterator<Item = PublicHash>,
        rank_table: RankTable,
    ) -> ConsensusState {
        ConsensusState {
            max_blocks_per_formulator: max_blocks_per_formulator.max(1),
            observer_key_map: observers.into_iter().map(|observer| (observer, true)).collect(),
            blocks_by_same_formulator: 0,
            rank_table,
        }
    }

    pub fn max_blocks_per_formulator(&self) -> u32 {
        self.max_blocks_per_formulator
    }

    pub fn blocks_by_same_formulator(&self) -> u32 {
        self.blocks_by_same_formulator
    }

    pub fn rank_table(&self) -> &RankTable {
        &self.rank_table
    }

    /// The observers in ascending public hash order. Observer signatures in a block follow this order.
    pub fn observers(&self) -> Vec<PublicHash> {
        self.observer_key_map
            .iter()
            .filter(|(_, active)| **active)
            .map(|(observer, _)| *observer)
            .collect()
    }

    pub fn is_observer(&self, public_hash: &PublicHash) -> bool {
        self.observer_key_map.get(public_hash).copied().unwrap_or(false)
    }

    pub fn observer_count(&self) -> usize {
        self.observer_key_map.values().filter(|active| **active).count()
    }

    /// Votes needed to commit a block.
    pub fn quorum(&self) -> usize {
        super::quorum(self.observer_count())
    }

    /// Round votes needed to settle on a formulator.
    pub fn supermajority(&self) -> usize {
        super::supermajority(self.observer_count())
    }

    /// How many blocks the formulator at `timeout_count` may produce in its turn.
    pub fn remain_blocks(&self, timeout_count: TimeoutCount) -> u32 {
        if timeout_count == 0 {
            self.max_blocks_per_formulator
                .saturating_sub(self.blocks_by_same_formulator)
                .max(1)
        } else {
            self.max_blocks_per_formulator
        }
    }

    /// Rotate the rank table for a newly connected block.
    ///
    /// Formulators skipped by the block's timeout count are moved down first. Then the block counts
    /// towards its formulator's turn, and a formulator that used up its turn is moved down as well.
    pub fn apply_block(
        &mut self,
        header: &Header,
        max_phase_diff: Option<u32>,
    ) -> Result<(), ConsensusError> {
        let timeout_count = header
            .timeout_count()
            .ok_or(ConsensusError::InvalidConsensusData)?;

        if timeout_count > 0 {
            self.rank_table.forward_candidates(timeout_count)?;
            self.blocks_by_same_formulator = 0;
        }

        self.blocks_by_same_formulator += 1;
        if self.blocks_by_same_formulator >= self.max_blocks_per_formulator {
            self.rank_table.forward_top(header.hash())?;
            self.blocks_by_same_formulator = 0;
        }

        if let Some(max_phase_diff) = max_phase_diff {
            self.rank_table.clip_phases(max_phase_diff);
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ConsensusError> {
        PersistedConsensusState {
            max_blocks_per_formulator: self.max_blocks_per_formulator,
            observer_key_map: self.observer_key_map.clone(),
            blocks_by_same_formulator: self.blocks_by_same_formulator,
            rank_table: self.rank_table.to_bytes(),
        }
        .try_to_vec()
        .map_err(|error| ConsensusError::Encoding(error.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<ConsensusState, ConsensusError> {
        let persisted = PersistedConsensusState::try_from_slice(bytes)
            .map_err(|error| ConsensusError::Encoding(error.to_string()))?;
        Ok(ConsensusState {
            max_blocks_per_formulator: persisted.max_blocks_per_formulator,
            observer_key_map: persisted.observer_key_map,
            blocks_by_same_formulator: persisted.blocks_by_same_formulator,
            rank_table: RankTable::from_bytes(persisted.rank_table)?,
        })
    }

    /// Read the state stored by [`save`](Self::save), if any.
    pub fn load<P: Provider + ?Sized>(provider: &P) -> Result<Option<ConsensusState>, ConsensusError> {
        provider
            .process_data(CONSENSUS_STATE_TAG)
            .map(|bytes| ConsensusState::decode(&bytes))
            .transpose()
    }

    pub fn save<C: Committer + ?Sized>(&self, committer: &C) -> Result<(), ConsensusError> {
        let bytes = self.encode()?;
        committer
            .save_process_data(CONSENSUS_STATE_TAG, bytes)
            .map_err(ConsensusError::from)
    }
}

/// Store the genesis consensus state unless the chain already has one.
pub fn initialize<C: Provider + Committer>(
    chain: &C,
    genesis: &ConsensusState,
) -> Result<(), ConsensusError> {
    if chain.process_data(CONSENSUS_STATE_TAG).is_none() {
        genesis.save(chain)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rank_table::Rank;
    use crate::types::basic::{Address, BlockHeight, ChainID, CryptoHash};

    fn address(byte: u8) -> Address {
        Address::new([byte; 20])
    }

    fn genesis(max_blocks_per_formulator: u32) -> ConsensusState {
        let ranks = (1..=3).map(|byte| {
            Rank::new(
                address(byte),
                PublicHash::new([byte; 32]),
                0,
                CryptoHash::new([7; 32]),
            )
        });
        ConsensusState::new(
            max_blocks_per_formulator,
            (10..15).map(|byte| PublicHash::new([byte; 32])),
            RankTable::from_candidates(0, ranks).unwrap(),
        )
    }

    fn header(height: u32, generator: Address, timeout_count: u32) -> Header {
        Header {
            chain_id: ChainID::new(0),
            version: 1,
            height: BlockHeight::new(height),
            prev_hash: CryptoHash::default(),
            body_hash: CryptoHash::default(),
            context_hash: CryptoHash::default(),
            timestamp: height as u64,
            generator,
            consensus_data: Header::encode_consensus_data(timeout_count),
        }
    }

    #[test]
    fn quorum_sizes() {
        let state = genesis(10);
        assert_eq!(state.observer_count(), 5);
        assert_eq!(state.quorum(), 3);
        assert_eq!(state.supermajority(), 4);
    }

    #[test]
    fn top_formulator_keeps_its_turn_until_max_blocks() {
        let mut state = genesis(3);
        assert_eq!(state.remain_blocks(0), 3);

        state.apply_block(&header(1, address(1), 0), None).unwrap();
        assert_eq!(state.blocks_by_same_formulator(), 1);
        assert_eq!(state.remain_blocks(0), 2);
        assert_eq!(state.rank_table().top_rank(0).unwrap().address, address(1));

        state.apply_block(&header(2, address(1), 0), None).unwrap();
        let last = header(3, address(1), 0);
        state.apply_block(&last, None).unwrap();

        assert_eq!(state.blocks_by_same_formulator(), 0);
        let forwarded = state.rank_table().rank(&address(1)).unwrap();
        assert_eq!(forwarded.phase(), 1);
        assert_eq!(forwarded.hash_space(), last.hash());
        assert_eq!(state.rank_table().top_rank(0).unwrap().address, address(2));
    }

    #[test]
    fn timeout_count_skips_formulators_and_restarts_the_turn() {
        let mut state = genesis(3);
        state.apply_block(&header(1, address(1), 0), None).unwrap();
        state.apply_block(&header(2, address(2), 1), None).unwrap();

        assert_eq!(state.rank_table().rank(&address(1)).unwrap().phase(), 2);
        assert_eq!(state.rank_table().top_rank(0).unwrap().address, address(2));
        assert_eq!(state.blocks_by_same_formulator(), 1);
        assert_eq!(state.remain_blocks(1), 3);
    }

    #[test]
    fn malformed_consensus_data_is_rejected() {
        let mut state = genesis(3);
        let mut malformed = header(1, address(1), 0);
        malformed.consensus_data.clear();
        assert_eq!(
            state.apply_block(&malformed, None),
            Err(ConsensusError::InvalidConsensusData)
        );
    }

    #[test]
    fn encoding_round_trips() {
        let mut state = genesis(2);
        state.apply_block(&header(1, address(1), 0), None).unwrap();
        state.apply_block(&header(2, address(1), 0), None).unwrap();
        state.apply_block(&header(3, address(2), 0), None).unwrap();

        let decoded = ConsensusState::decode(&state.encode().unwrap()).unwrap();
        assert_eq!(decoded.max_blocks_per_formulator(), 2);
        assert_eq!(decoded.blocks_by_same_formulator(), 1);
        assert_eq!(decoded.observers(), state.observers());
        assert_eq!(
            decoded.rank_table().candidates(),
            state.rank_table().candidates()
        );
        assert_eq!(decoded.rank_table().height(), 1);
    }
}
