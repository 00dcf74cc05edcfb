/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events emitted by observer and formulator nodes, for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed.

use std::sync::mpsc::Sender;
use std::time::{Duration, SystemTime};

use crate::networking::PeerID;
use crate::types::basic::{Address, BlockHeight, CryptoHash, PublicHash, TimeoutCount};

pub enum Event {
    // Events that change persistent state.
    CommitBlock(CommitBlockEvent),
    ConsensusHalted(ConsensusHaltedEvent),
    InvalidContextHash(InvalidContextHashEvent),
    // Observer voting round events.
    StartRound(StartRoundEvent),
    RoundTimeout(RoundTimeoutEvent),
    IgnoreFormulator(IgnoreFormulatorEvent),
    SendBlockReq(SendBlockReqEvent),
    ReceiveBlockGen(ReceiveBlockGenEvent),
    // Formulator events.
    GenerateBlock(GenerateBlockEvent),
    ReceiveObSign(ReceiveObSignEvent),
    // Block sync events.
    ReceiveBlocks(ReceiveBlocksEvent),
}

impl Event {
    /// Send the event to the event bus, if there is one. A closed bus is ignored: events are never worth
    /// stopping consensus for.
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// A block was connected to the chain and the consensus state rotated for it.
pub struct CommitBlockEvent {
    pub timestamp: SystemTime,
    pub block: CryptoHash,
    pub height: BlockHeight,
    pub generator: Address,
    pub transactions: usize,
}

/// The node found a fork and stopped committing blocks.
pub struct ConsensusHaltedEvent {
    pub timestamp: SystemTime,
    pub reason: String,
}

/// Executing a block produced a different context hash than its header claims. The block was rejected;
/// the node keeps running.
pub struct InvalidContextHashEvent {
    pub timestamp: SystemTime,
    pub block: CryptoHash,
    pub height: BlockHeight,
    pub generator: Address,
    pub expected: CryptoHash,
    pub computed: CryptoHash,
}

/// The observer started voting on who produces the blocks starting at `target_height`.
pub struct StartRoundEvent {
    pub timestamp: SystemTime,
    pub target_height: BlockHeight,
    pub timeout_count: TimeoutCount,
    pub formulator: Address,
}

/// The voting round did not progress in time and was abandoned.
pub struct RoundTimeoutEvent {
    pub timestamp: SystemTime,
    pub target_height: BlockHeight,
    pub formulator: Address,
}

pub struct IgnoreFormulatorEvent {
    pub timestamp: SystemTime,
    pub formulator: Address,
    pub duration: Duration,
}

/// The observer, as the elected leader of a round, asked the formulator for blocks.
pub struct SendBlockReqEvent {
    pub timestamp: SystemTime,
    pub formulator: Address,
    pub target_height: BlockHeight,
    pub timeout_count: TimeoutCount,
}

/// The observer received a proposed block and voted for it.
pub struct ReceiveBlockGenEvent {
    pub timestamp: SystemTime,
    pub origin: PeerID,
    pub block: CryptoHash,
    pub height: BlockHeight,
}

/// The formulator produced and sent a block of its burst.
pub struct GenerateBlockEvent {
    pub timestamp: SystemTime,
    pub block: CryptoHash,
    pub height: BlockHeight,
    pub transactions: usize,
}

/// The formulator received the observer signatures for one of its blocks.
pub struct ReceiveObSignEvent {
    pub timestamp: SystemTime,
    pub origin: PublicHash,
    pub block: CryptoHash,
    pub height: BlockHeight,
    pub signatures: usize,
}

/// The node received blocks from a peer while catching up.
pub struct ReceiveBlocksEvent {
    pub timestamp: SystemTime,
    pub peer: PeerID,
    pub first_height: BlockHeight,
    pub blocks: usize,
}
