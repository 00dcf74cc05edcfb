/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! State and rules shared by every node role of Proof-of-Formulator consensus.
//!
//! The [`ConsensusState`] holds the fixed observer set and the formulator [rank
//! table](crate::rank_table). Every node keeps its own copy, persisted in the chain's process data,
//! and updates it in lockstep with the chain: a block is connected and the state is rotated for it
//! while holding the same lock, so readers never see a rank table that disagrees with the chain's tip.
//!
//! ## Halting
//!
//! A fork (two certified blocks at the same height) means the node can no longer trust its own view of
//! the chain. Rather than crash, the node raises its [`HaltSignal`]. A halted node keeps serving peers
//! and answering introspection calls, but never connects another block.
//!
//! A block that executes to a different context than its header claims is rejected with an `error` log
//! and an [`InvalidContextHashEvent`]. The node itself keeps running.

mod state;
mod validate;

pub use state::{initialize, ConsensusState, CONSENSUS_STATE_TAG};
pub use validate::{validate_block_certificate, validate_block_signatures};

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use crate::chain::{Chain, ChainError, SignerHintMap};
use crate::config::ConsensusPolicy;
use crate::events::{ConsensusHaltedEvent, Event, InvalidContextHashEvent};
use crate::rank_table::RankTableError;
use crate::types::basic::{BlockHeight, CryptoHash};
use crate::types::block::Block;

/// Votes needed out of `observer_count` observers to commit a block.
pub fn quorum(observer_count: usize) -> usize {
    observer_count / 2 + 1
}

/// Round votes needed out of `observer_count` observers to settle on a formulator.
pub fn supermajority(observer_count: usize) -> usize {
    (observer_count / 2 + 2).min(observer_count)
}

/// Shared flag raised when consensus integrity is violated. Once raised, it stays raised.
#[derive(Clone, Default)]
pub struct HaltSignal {
    halted: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl HaltSignal {
    pub fn new() -> HaltSignal {
        HaltSignal::default()
    }

    /// Raise the signal. Returns `false` if it was already raised, in which case the first reason is
    /// kept.
    pub fn raise(&self, reason: String) -> bool {
        let mut stored = self
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if stored.is_some() {
            return false;
        }
        *stored = Some(reason);
        self.halted.store(true, Ordering::Release);
        true
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// A node's handle on the chain and its consensus state.
pub(crate) struct Consensus<C: Chain> {
    chain: C,
    state: Arc<Mutex<ConsensusState>>,
    policy: ConsensusPolicy,
    halt: HaltSignal,
    event_publisher: Option<Sender<Event>>,
}

impl<C: Chain> Clone for Consensus<C> {
    fn clone(&self) -> Self {
        Consensus {
            chain: self.chain.clone(),
            state: self.state.clone(),
            policy: self.policy.clone(),
            halt: self.halt.clone(),
            event_publisher: self.event_publisher.clone(),
        }
    }
}

impl<C: Chain> Consensus<C> {
    /// Load the consensus state persisted in `chain`.
    pub(crate) fn load(
        chain: C,
        policy: ConsensusPolicy,
        halt: HaltSignal,
        event_publisher: Option<Sender<Event>>,
    ) -> Result<Consensus<C>, ConsensusError> {
        let state = ConsensusState::load(&chain)?.ok_or(ConsensusError::NotInitialized)?;
        Ok(Consensus {
            chain,
            state: Arc::new(Mutex::new(state)),
            policy,
            halt,
            event_publisher,
        })
    }

    pub(crate) fn chain(&self) -> &C {
        &self.chain
    }

    pub(crate) fn policy(&self) -> &ConsensusPolicy {
        &self.policy
    }

    pub(crate) fn halt_signal(&self) -> &HaltSignal {
        &self.halt
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halt.is_halted()
    }

    /// Lock the consensus state. Connecting a block holds the same lock.
    pub(crate) fn state(&self) -> MutexGuard<'_, ConsensusState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A copy of the consensus state at the current tip.
    pub(crate) fn snapshot(&self) -> ConsensusState {
        self.state().clone()
    }

    /// Connect `block` on top of the chain's tip and rotate the consensus state for it.
    ///
    /// If `context` is given, it must be the post-state of `block` computed on the current tip; otherwise
    /// the chain re-executes the block.
    pub(crate) fn commit(
        &self,
        block: &Block,
        context: Option<C::Context>,
        signer_hint: Option<&SignerHintMap>,
    ) -> Result<(), ConsensusError> {
        if self.halt.is_halted() {
            return Err(ConsensusError::Halted);
        }

        let mut state = self.state();
        let height = self.chain.height();
        if block.height() <= height {
            let local = self.chain.hash(block.height())?;
            return if local == block.hash() {
                Err(ConsensusError::AlreadyConnected(block.height()))
            } else {
                Err(ConsensusError::FoundForkedBlock {
                    height: block.height(),
                    local,
                    remote: block.hash(),
                })
            };
        }
        if block.height() != height.next() {
            return Err(ConsensusError::NotNextHeight {
                expected: height.next(),
                got: block.height(),
            });
        }

        let mut next_state = state.clone();
        next_state.apply_block(&block.header, self.policy.max_phase_diff)?;

        let connected = match context {
            Some(context) => self.chain.connect_block_with_context(block, context),
            None => self.chain.connect_block(block, signer_hint),
        };
        if let Err(ChainError::InvalidContextHash { expected, computed }) = &connected {
            self.reject_context(block, *expected, *computed);
        }
        connected?;
        next_state.save(&self.chain)?;
        *state = next_state;
        Ok(())
    }

    /// Log a block whose execution disagrees with its header's context hash, and publish an
    /// [`InvalidContextHashEvent`].
    pub(crate) fn reject_context(&self, block: &Block, expected: CryptoHash, computed: CryptoHash) {
        log::error!(
            "block {} at {} by {} executes to context {}, header claims {}",
            block.hash(),
            block.height(),
            block.header.generator,
            computed,
            expected
        );
        Event::InvalidContextHash(InvalidContextHashEvent {
            timestamp: SystemTime::now(),
            block: block.hash(),
            height: block.height(),
            generator: block.header.generator,
            expected,
            computed,
        })
        .publish(&self.event_publisher);
    }

    /// Raise the halt signal, log the reason, and publish a [`ConsensusHaltedEvent`].
    pub(crate) fn halt(&self, reason: String) {
        if self.halt.raise(reason.clone()) {
            log::error!("consensus halted: {}", reason);
            Event::ConsensusHalted(ConsensusHaltedEvent {
                timestamp: SystemTime::now(),
                reason,
            })
            .publish(&self.event_publisher);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    /// The chain has no persisted consensus state.
    NotInitialized,
    InvalidConsensusData,
    InvalidSignatureCount { got: usize, required: usize },
    InvalidTopSignature,
    InvalidTopAddress,
    InvalidObserverKey,
    AlreadyConnected(BlockHeight),
    NotNextHeight { expected: BlockHeight, got: BlockHeight },
    FoundForkedBlock {
        height: BlockHeight,
        local: CryptoHash,
        remote: CryptoHash,
    },
    Halted,
    Encoding(String),
    RankTable(RankTableError),
    Chain(ChainError),
}

impl ConsensusError {
    /// Whether the error means the node's view of the chain can no longer be trusted. Only a fork
    /// qualifies: an invalid context hash condemns the block, not the node.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsensusError::FoundForkedBlock { .. })
    }
}

impl From<ChainError> for ConsensusError {
    fn from(value: ChainError) -> Self {
        ConsensusError::Chain(value)
    }
}

impl From<RankTableError> for ConsensusError {
    fn from(value: RankTableError) -> Self {
        ConsensusError::RankTable(value)
    }
}

impl Display for ConsensusError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusError::NotInitialized => write!(f, "consensus state is not initialized"),
            ConsensusError::InvalidConsensusData => write!(f, "invalid consensus data in header"),
            ConsensusError::InvalidSignatureCount { got, required } => {
                write!(f, "{} observer signatures, {} required", got, required)
            }
            ConsensusError::InvalidTopSignature => write!(f, "invalid generator signature"),
            ConsensusError::InvalidTopAddress => write!(f, "generator is not the top formulator"),
            ConsensusError::InvalidObserverKey => write!(f, "signature by a non-observer"),
            ConsensusError::AlreadyConnected(height) => {
                write!(f, "block {} is already connected", height)
            }
            ConsensusError::NotNextHeight { expected, got } => {
                write!(f, "expected block {}, got {}", expected, got)
            }
            ConsensusError::FoundForkedBlock {
                height,
                local,
                remote,
            } => write!(
                f,
                "found forked block at height {}: local {}, remote {}",
                height, local, remote
            ),
            ConsensusError::Halted => write!(f, "consensus is halted"),
            ConsensusError::Encoding(reason) => write!(f, "encoding error: {}", reason),
            ConsensusError::RankTable(error) => write!(f, "rank table: {}", error),
            ConsensusError::Chain(error) => write!(f, "chain: {}", error),
        }
    }
}
