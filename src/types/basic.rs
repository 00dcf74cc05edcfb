/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" types that are sent around and inspected but have no active behavior of their own.
//!
//! These types follow the newtype pattern. Each one wraps a fixed-size integer or byte array and
//! exposes a small API for constructing it and reading its inner value.

use borsh::{BorshDeserialize, BorshSerialize};
use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign, Sub},
    time::{SystemTime, UNIX_EPOCH},
};

/// Number of consecutive formulator timeouts that preceded a block. Carried in
/// [`Header::consensus_data`](crate::types::block::Header::consensus_data).
pub type TimeoutCount = u32;

/// Nanoseconds since the Unix Epoch.
pub type Timestamp = u64;

/// The current wall clock time as a [`Timestamp`]. Clocks set before the Unix Epoch read as zero.
pub fn timestamp_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as Timestamp)
        .unwrap_or_default()
}

/// Id of the blockchain, used to identify the blockchain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct ChainID(u8);

impl ChainID {
    pub const fn new(int: u8) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u8 {
        self.0
    }
}

/// Height of a block in the blockchain. The genesis block has height 0.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct BlockHeight(u32);

impl BlockHeight {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }

    /// The height directly after this one, saturating at `u32::MAX`.
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Display for BlockHeight {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl AddAssign<u32> for BlockHeight {
    fn add_assign(&mut self, rhs: u32) {
        self.0.add_assign(rhs)
    }
}

impl Add<u32> for BlockHeight {
    type Output = BlockHeight;
    fn add(self, rhs: u32) -> Self::Output {
        BlockHeight::new(self.0.add(rhs))
    }
}

impl Sub<BlockHeight> for BlockHeight {
    type Output = u32;
    fn sub(self, rhs: BlockHeight) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

/// A SHA-256 digest.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// Hash of a public key. Observers are identified by their public hash, and every formulator has a
/// "generator" public hash whose key signs its block headers.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct PublicHash([u8; 32]);

impl PublicHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for PublicHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl Debug for PublicHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// On-chain identifier of a formulator.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Address([u8; 20]);

impl Address {
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 20] {
        self.0
    }

    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

fn write_hex(f: &mut Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for byte in bytes {
        write!(f, "{:02x}", byte)?;
    }
    Ok(())
}

/// Time slot that a timestamp falls into, given the chain's slot length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Slot(u32);

impl Slot {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }

    /// `slot(ts) = ts / slot_length_ns`.
    pub fn of(timestamp: Timestamp, slot_length_ns: u64) -> Slot {
        Slot((timestamp / slot_length_ns.max(1)) as u32)
    }

    pub fn prev(&self) -> Slot {
        Slot(self.0.saturating_sub(1))
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
