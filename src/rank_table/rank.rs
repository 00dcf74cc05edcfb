/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`Rank`] of a single formulator.

use std::cmp::Ordering;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{Address, CryptoHash, PublicHash};

/// A formulator's position in the rotation.
///
/// Ranks are ordered by their [score](Rank::score), and ranks with equal scores are ordered by
/// address. Since addresses are unique within a [`RankTable`](super::RankTable), no two ranks in a
/// table compare equal.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Rank {
    pub address: Address,
    pub public_hash: PublicHash,
    phase: u32,
    hash_space: CryptoHash,
}

impl Rank {
    pub fn new(
        address: Address,
        public_hash: PublicHash,
        phase: u32,
        hash_space: CryptoHash,
    ) -> Rank {
        Rank {
            address,
            public_hash,
            phase,
            hash_space,
        }
    }

    pub fn phase(&self) -> u32 {
        self.phase
    }

    pub fn hash_space(&self) -> CryptoHash {
        self.hash_space
    }

    /// `(phase << 32) | LE32(hash_space[0..4])`.
    pub fn score(&self) -> u64 {
        let bytes = self.hash_space.as_bytes();
        let low = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        ((self.phase as u64) << 32) | low as u64
    }

    /// Compare two ranks by score, then by address.
    pub fn priority_cmp(&self, other: &Rank) -> Ordering {
        self.score()
            .cmp(&other.score())
            .then_with(|| self.address.cmp(&other.address))
    }

    /// Whether `self` comes strictly before `other` in the rotation.
    pub fn less(&self, other: &Rank) -> bool {
        self.priority_cmp(other) == Ordering::Less
    }

    pub(crate) fn set(&mut self, phase: u32, hash_space: CryptoHash) {
        self.phase = phase;
        self.hash_space = hash_space;
    }
}
