/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are sent between nodes as part of the block sync protocol.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{BlockHeight, CryptoHash};
use crate::types::block::Block;

/// Most blocks a single [`RequestMessage`] may ask for.
pub const MAX_BLOCKS_PER_REQUEST: u8 = 10;

/// The latest tip a node has connected.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StatusMessage {
    pub version: u16,
    pub height: BlockHeight,
    pub last_hash: CryptoHash,
}

/// Ask for `count` consecutive blocks starting at `height`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RequestMessage {
    pub height: BlockHeight,
    pub count: u8,
}

impl RequestMessage {
    /// The heights requested, with `count` clamped to `[1, MAX_BLOCKS_PER_REQUEST]`.
    pub fn heights(&self) -> impl Iterator<Item = BlockHeight> {
        let count = self.count.clamp(1, MAX_BLOCKS_PER_REQUEST) as u32;
        let start = self.height;
        (0..count).map(move |offset| start + offset)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockMessage {
    pub blocks: Vec<Block>,
}
