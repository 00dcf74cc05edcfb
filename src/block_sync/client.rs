/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The requesting side of the block sync protocol, which catches a node up with the tip its peers
//! report.
//!
//! ## Requesting blocks
//!
//! The client remembers the latest [`StatusMessage`] of every connected peer. Whenever a peer reports a
//! height above the local tip, the client requests the window of (at most 10) heights that follows the
//! tip:
//! 1. If no height of the window is already requested and some peer covers the whole window, the whole
//!    window is requested from that peer in a single message.
//! 2. Otherwise every height of the window that is neither requested nor queued is requested on its own
//!    from a peer that has it.
//!
//! Every request is tracked in a [`RequestTimer`]. When it expires without an answer, the height is
//! requested again, possibly from another peer. When a peer disconnects, its requests are dropped.
//!
//! ## Committing blocks
//!
//! Received blocks are buffered in a [`SortedBlockQueue`] and committed in height order once the block
//! right after the tip is there. Each is checked against the consensus state of its parent with
//! [`validate_block_signatures`] before it is committed.
//!
//! ## Forks
//!
//! Every received block must carry a certificate: its generator's signature and a quorum of observer
//! signatures. A peer that delivers a block without one is removed, and the node carries on.
//!
//! If a peer delivers a certified block at a height where the node already has a different block,
//! connected or queued, the client reports a fork: the queued block is dropped, the delivering peer is
//! removed, and the node halts. It never guesses which of the two blocks is the right one.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::seq::SliceRandom;

use crate::block_queue::{FindOrInsert, SortedBlockQueue};
use crate::chain::Chain;
use crate::consensus::{
    validate_block_certificate, validate_block_signatures, Consensus, ConsensusError,
};
use crate::events::{Event, ReceiveBlocksEvent};
use crate::networking::network::{Network, PeerID};
use crate::networking::sending::SenderHandle;
use crate::request_timer::RequestTimer;
use crate::types::basic::{BlockHeight, CryptoHash};
use crate::types::block::Block;

use super::messages::{RequestMessage, StatusMessage, MAX_BLOCKS_PER_REQUEST};

pub(crate) struct BlockSyncClient<C: Chain, N: Network> {
    consensus: Consensus<C>,
    sender: SenderHandle<N>,
    status_map: HashMap<PeerID, StatusMessage>,
    request_timer: Arc<RequestTimer<PeerID>>,
    block_queue: SortedBlockQueue<(PeerID, Block)>,
    request_timeout: Duration,
    event_publisher: Option<Sender<Event>>,
}

impl<C: Chain, N: Network> BlockSyncClient<C, N> {
    pub(crate) fn new(
        consensus: Consensus<C>,
        sender: SenderHandle<N>,
        request_timer: Arc<RequestTimer<PeerID>>,
        request_timeout: Duration,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        Self {
            consensus,
            sender,
            status_map: HashMap::new(),
            request_timer,
            block_queue: SortedBlockQueue::new(),
            request_timeout,
            event_publisher,
        }
    }

    /// The highest height any connected peer reported.
    pub(crate) fn best_height(&self) -> Option<BlockHeight> {
        self.status_map.values().map(|status| status.height).max()
    }

    pub(crate) fn on_status(&mut self, origin: PeerID, status: StatusMessage) {
        let newer = self
            .status_map
            .get(&origin)
            .map_or(true, |known| status.height > known.height);
        if newer {
            self.status_map.insert(origin, status);
        }
        self.request_missing_blocks();
    }

    pub(crate) fn on_disconnected(&mut self, peer: PeerID) {
        self.status_map.remove(&peer);
        self.request_timer.removes_by_value(&peer);
    }

    /// A request for `height` sent to `peer` went unanswered.
    pub(crate) fn on_request_expired(&mut self, height: BlockHeight, peer: PeerID) {
        log::debug!("request for block {} to {} expired", height, peer);
        self.request_missing_blocks();
    }

    pub(crate) fn on_blocks(&mut self, origin: PeerID, blocks: Vec<Block>) {
        if let Some(first) = blocks.first() {
            Event::ReceiveBlocks(ReceiveBlocksEvent {
                timestamp: SystemTime::now(),
                peer: origin,
                first_height: first.height(),
                blocks: blocks.len(),
            })
            .publish(&self.event_publisher);
        }

        for block in blocks {
            let height = block.height();
            self.request_timer.remove(height);
            if let Err(error) = self.add_block(origin, block) {
                self.on_rejected(origin, error);
                return;
            }
        }
        self.try_commit();
        self.request_missing_blocks();
    }

    /// Queue a block received from `origin`, checking it against what the node already has at its height.
    ///
    /// A block that differs from the local one is only reported as a fork if it carries a valid
    /// certificate. Anything else is an invalid block.
    pub(crate) fn add_block(&mut self, origin: PeerID, block: Block) -> Result<(), BlockSyncError> {
        let height = block.height();
        let remote = block.hash();
        let connected = if height <= self.consensus.chain().height() {
            let local = self.consensus.chain().hash(height)?;
            if local == remote {
                return Ok(());
            }
            Some(local)
        } else {
            None
        };

        validate_block_certificate(&self.consensus.state(), &block)
            .map_err(|error| BlockSyncError::InvalidBlock { height, error })?;

        if let Some(local) = connected {
            return Err(BlockSyncError::FoundForkedBlock {
                height,
                local,
                remote,
            });
        }

        let queued = match self.block_queue.find_or_insert((origin, block), height) {
            FindOrInsert::Inserted => return Ok(()),
            FindOrInsert::Found((_, queued)) => queued.hash(),
        };
        if queued == remote {
            return Ok(());
        }
        self.block_queue.remove(height);
        Err(BlockSyncError::FoundForkedBlock {
            height,
            local: queued,
            remote,
        })
    }

    /// Commit queued blocks for as long as the block after the tip is available.
    pub(crate) fn try_commit(&mut self) {
        while !self.consensus.is_halted() {
            let next = self.consensus.chain().height().next();
            let (origin, block) = match self.block_queue.pop_until(next) {
                Some(entry) => entry,
                None => return,
            };

            let validation = validate_block_signatures(&self.consensus.snapshot(), &block);
            let result = validation.and_then(|_| self.consensus.commit(&block, None, None));
            match result {
                Ok(()) => log::debug!("synced block {} from {}", next, origin),
                Err(ConsensusError::AlreadyConnected(_)) => (),
                Err(error) if error.is_fatal() => {
                    self.sender.remove_peer(origin);
                    self.consensus.halt(error.to_string());
                    return;
                }
                Err(error) => {
                    log::warn!("discarding block {} from {}: {}", next, origin, error);
                    return;
                }
            }
        }
    }

    /// Request the window of heights after the tip from the peers that reported them.
    pub(crate) fn request_missing_blocks(&mut self) {
        if self.consensus.is_halted() {
            return;
        }
        let best = match self.best_height() {
            Some(best) => best,
            None => return,
        };
        let tip = self.consensus.chain().height();
        if best <= tip {
            return;
        }

        let start = tip.next();
        let window: Vec<BlockHeight> = (0..MAX_BLOCKS_PER_REQUEST as u32)
            .map(|offset| start + offset)
            .collect();
        let window_end = start + (MAX_BLOCKS_PER_REQUEST as u32 - 1);
        let mut rng = rand::thread_rng();

        let window_free = window
            .iter()
            .all(|height| !self.request_timer.exist(*height) && self.block_queue.find(*height).is_none());
        if window_free {
            let covering: Vec<PeerID> = self.peers_with(window_end);
            if let Some(peer) = covering.choose(&mut rng) {
                self.sender.send(
                    *peer,
                    RequestMessage {
                        height: start,
                        count: MAX_BLOCKS_PER_REQUEST,
                    },
                );
                for height in &window {
                    self.request_timer.add(*height, self.request_timeout, *peer);
                }
                return;
            }
        }

        for height in window.into_iter().filter(|height| *height <= best) {
            if self.request_timer.exist(height) || self.block_queue.find(height).is_some() {
                continue;
            }
            let holders = self.peers_with(height);
            if let Some(peer) = holders.choose(&mut rng) {
                self.sender.send(*peer, RequestMessage { height, count: 1 });
                self.request_timer.add(height, self.request_timeout, *peer);
            }
        }
    }

    fn peers_with(&self, height: BlockHeight) -> Vec<PeerID> {
        let mut peers: Vec<PeerID> = self
            .status_map
            .iter()
            .filter(|(_, status)| status.height >= height)
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort();
        peers
    }

    fn on_rejected(&mut self, origin: PeerID, error: BlockSyncError) {
        self.status_map.remove(&origin);
        self.request_timer.removes_by_value(&origin);
        self.sender.remove_peer(origin);
        match error {
            BlockSyncError::FoundForkedBlock { .. } => {
                log::error!("{} delivered by {}", error, origin);
                self.consensus.halt(error.to_string());
            }
            error => log::warn!("removing {}: {}", origin, error),
        }
    }
}

#[derive(Debug)]
pub enum BlockSyncError {
    FoundForkedBlock {
        height: BlockHeight,
        local: CryptoHash,
        remote: CryptoHash,
    },
    InvalidBlock {
        height: BlockHeight,
        error: ConsensusError,
    },
    Consensus(ConsensusError),
}

impl From<ConsensusError> for BlockSyncError {
    fn from(error: ConsensusError) -> Self {
        BlockSyncError::Consensus(error)
    }
}

impl From<crate::chain::ChainError> for BlockSyncError {
    fn from(error: crate::chain::ChainError) -> Self {
        BlockSyncError::Consensus(error.into())
    }
}

impl Display for BlockSyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BlockSyncError::FoundForkedBlock {
                height,
                local,
                remote,
            } => write!(
                f,
                "found forked block at height {}: have {}, got {}",
                height, local, remote
            ),
            BlockSyncError::InvalidBlock { height, error } => {
                write!(f, "invalid block at height {}: {}", height, error)
            }
            BlockSyncError::Consensus(error) => write!(f, "{}", error),
        }
    }
}
