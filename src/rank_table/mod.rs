/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The deterministic rotation order of the formulators.
//!
//! The [`RankTable`] keeps every active formulator's [`Rank`] sorted by priority. The candidate at
//! index `i` is the formulator that should produce the next block if the `i` formulators before it
//! timed out in a row.
//!
//! ## Rotation
//!
//! The table is rotated in two ways, both of which re-sort the affected ranks:
//! 1. [`forward_top`](RankTable::forward_top): the top formulator finished its turn. Its phase goes up
//!    by one and its hash space becomes the hash of the last block of its turn.
//! 2. [`forward_candidates`](RankTable::forward_candidates): the top `n` formulators timed out. Each of
//!    their phases goes up by two, so formulators that keep failing drift down faster than producers
//!    advance.
//!
//! Every node applies the same rotations in the same order, so every node computes byte-identical
//! candidate lists.

mod rank;

pub use rank::Rank;

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{Address, CryptoHash, PublicHash};

#[derive(Clone, Debug, Default)]
pub struct RankTable {
    height: u32,
    candidates: Vec<Rank>,
    rank_map: HashMap<Address, Rank>,
}

impl RankTable {
    pub fn new() -> RankTable {
        RankTable::default()
    }

    /// Build a table from an unordered list of genesis candidates.
    pub fn from_candidates(
        height: u32,
        candidates: impl IntoIterator<Item = Rank>,
    ) -> Result<RankTable, RankTableError> {
        let mut ranks: Vec<Rank> = candidates.into_iter().collect();
        ranks.sort_by(|a, b| a.priority_cmp(b));

        let mut table = RankTable {
            height,
            ..RankTable::default()
        };
        for rank in ranks {
            table.add_rank(rank)?;
        }
        Ok(table)
    }

    /// Number of forward_top rotations applied so far.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// All candidates in rotation order.
    pub fn candidates(&self) -> &[Rank] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn rank(&self, address: &Address) -> Option<&Rank> {
        self.rank_map.get(address)
    }

    pub fn add_rank(&mut self, rank: Rank) -> Result<(), RankTableError> {
        if self.rank_map.contains_key(&rank.address) {
            return Err(RankTableError::ExistAddress(rank.address));
        }
        if let Some(smallest) = self.candidates.first() {
            if rank.phase() < smallest.phase() {
                return Err(RankTableError::InvalidPhase {
                    phase: rank.phase(),
                    smallest: smallest.phase(),
                });
            }
        }
        self.rank_map.insert(rank.address, rank.clone());
        self.insert_sorted(rank);
        Ok(())
    }

    /// Remove the rank of `address` if there is one.
    pub fn remove_rank(&mut self, address: &Address) {
        if self.rank_map.remove(address).is_some() {
            self.candidates.retain(|rank| &rank.address != address);
        }
    }

    /// The candidate at index `timeout_count`.
    pub fn top_rank(&self, timeout_count: u32) -> Result<Rank, RankTableError> {
        self.candidates
            .get(timeout_count as usize)
            .cloned()
            .ok_or(RankTableError::InsufficientCandidate {
                index: timeout_count,
                candidates: self.candidates.len(),
            })
    }

    /// The first candidate in rotation order whose address is in `active_set`, along with its index.
    pub fn top_rank_in_map(
        &self,
        active_set: &HashSet<Address>,
    ) -> Result<(Rank, u32), RankTableError> {
        self.candidates
            .iter()
            .enumerate()
            .find(|(_, rank)| active_set.contains(&rank.address))
            .map(|(index, rank)| (rank.clone(), index as u32))
            .ok_or(RankTableError::InsufficientCandidate {
                index: 0,
                candidates: 0,
            })
    }

    /// Up to `limit` candidates in rotation order whose addresses are in `active_set`.
    pub fn ranks_in_map(&self, active_set: &HashSet<Address>, limit: usize) -> Vec<Rank> {
        self.candidates
            .iter()
            .filter(|rank| active_set.contains(&rank.address))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Whether `address` is a candidate whose generator key hashes to `public_hash`.
    pub fn is_formulator(&self, address: &Address, public_hash: &PublicHash) -> bool {
        self.rank_map
            .get(address)
            .is_some_and(|rank| &rank.public_hash == public_hash)
    }

    /// Move the top `n` candidates down the rotation after they timed out.
    pub fn forward_candidates(&mut self, n: u32) -> Result<(), RankTableError> {
        let n = n as usize;
        if n > self.candidates.len() {
            return Err(RankTableError::InsufficientCandidate {
                index: n as u32,
                candidates: self.candidates.len(),
            });
        }
        let timed_out: Vec<Rank> = self.candidates.drain(0..n).collect();
        for mut rank in timed_out {
            let hash_space = rank.hash_space();
            rank.set(rank.phase().saturating_add(2), hash_space);
            self.rank_map.insert(rank.address, rank.clone());
            self.insert_sorted(rank);
        }
        Ok(())
    }

    /// Move the top candidate down the rotation after it finished its turn with `last_block_hash`.
    pub fn forward_top(&mut self, last_block_hash: CryptoHash) -> Result<(), RankTableError> {
        if self.candidates.is_empty() {
            return Err(RankTableError::InsufficientCandidate {
                index: 0,
                candidates: 0,
            });
        }
        let mut top = self.candidates.remove(0);
        top.set(top.phase().saturating_add(1), last_block_hash);
        self.rank_map.insert(top.address, top.clone());
        self.insert_sorted(top);
        self.height = self.height.saturating_add(1);
        Ok(())
    }

    /// Lift every phase that lags more than `max_phase_diff` behind the largest phase in the table.
    pub fn clip_phases(&mut self, max_phase_diff: u32) {
        let Some(max_phase) = self.candidates.iter().map(Rank::phase).max() else {
            return;
        };
        let floor = max_phase.saturating_sub(max_phase_diff);
        if self.candidates.first().map_or(true, |rank| rank.phase() >= floor) {
            return;
        }

        let ranks = std::mem::take(&mut self.candidates);
        for mut rank in ranks {
            if rank.phase() < floor {
                let hash_space = rank.hash_space();
                rank.set(floor, hash_space);
                self.rank_map.insert(rank.address, rank.clone());
            }
            self.insert_sorted(rank);
        }
    }

    fn insert_sorted(&mut self, rank: Rank) {
        let index = self.candidates.partition_point(|candidate| candidate.less(&rank));
        self.candidates.insert(index, rank);
    }

    pub(crate) fn to_bytes(&self) -> RankTableBytes {
        RankTableBytes {
            height: self.height,
            candidates: self.candidates.clone(),
        }
    }

    pub(crate) fn from_bytes(bytes: RankTableBytes) -> Result<RankTable, RankTableError> {
        RankTable::from_candidates(bytes.height, bytes.candidates)
    }
}

/// Persisted form of a [`RankTable`]: the height followed by the candidates in rotation order.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub(crate) struct RankTableBytes {
    pub(crate) height: u32,
    pub(crate) candidates: Vec<Rank>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RankTableError {
    ExistAddress(Address),
    InvalidPhase { phase: u32, smallest: u32 },
    InsufficientCandidate { index: u32, candidates: usize },
}

impl Display for RankTableError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RankTableError::ExistAddress(address) => write!(f, "address {} already ranked", address),
            RankTableError::InvalidPhase { phase, smallest } => write!(
                f,
                "phase {} is lower than the smallest phase {}",
                phase, smallest
            ),
            RankTableError::InsufficientCandidate { index, candidates } => write!(
                f,
                "no candidate at index {} ({} candidates)",
                index, candidates
            ),
        }
    }
}
