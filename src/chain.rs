/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits that specify the chain store and block executor that a node plugs into consensus.
//!
//! Consensus never stores blocks or applies transactions itself. It reads the tip of the chain through
//! [`Provider`], and asks a [`Committer`] to:
//! 1. Build blocks on behalf of a formulator ([`Committer::new_block_creator`]).
//! 2. Execute a proposed block on a scratch [`Context`](Committer::Context) and report the resulting
//!    context hash, so observers can check a formulator's header before co-signing it.
//! 3. Connect a finalized block, either by re-executing it or by applying a context that was already
//!    computed for it.
//!
//! ## Determinism
//!
//! Implementors are expected to be *deterministic*: executing the same block on the same parent state
//! must always yield the same context hash on every node. Otherwise observers will refuse to co-sign
//! honest formulators' blocks.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use crate::tx_pool::PoolItem;
use crate::types::basic::{Address, BlockHeight, ChainID, CryptoHash, PublicHash, Timestamp};
use crate::types::block::{Block, Header};

/// Signers that were already recovered for a transaction, keyed by transaction hash. Passing this to the
/// committer is an optimisation only: the committer must reach the same result without it.
pub type SignerHintMap = HashMap<CryptoHash, Vec<PublicHash>>;

/// Read access to the local chain.
pub trait Provider: Send + Sync {
    fn chain_id(&self) -> ChainID;

    fn version(&self) -> u16;

    /// Height of the latest connected block.
    fn height(&self) -> BlockHeight;

    /// Hash of the header of the latest connected block.
    fn last_hash(&self) -> CryptoHash;

    /// Timestamp of the latest connected block.
    fn last_timestamp(&self) -> Timestamp;

    /// `(height, last_hash)`. Implementors should read both values atomically.
    fn last_status(&self) -> (BlockHeight, CryptoHash) {
        (self.height(), self.last_hash())
    }

    /// Hash of the header at `height`.
    fn hash(&self, height: BlockHeight) -> Result<CryptoHash, ChainError>;

    /// The connected block at `height`.
    fn block(&self, height: BlockHeight) -> Result<Block, ChainError>;

    /// Persisted process state stored under `tag`, if any.
    fn process_data(&self, tag: &[u8]) -> Option<Vec<u8>>;
}

/// The header fields a formulator fixes before filling a block with transactions.
#[derive(Clone, Debug)]
pub struct BlockTemplate {
    pub chain_id: ChainID,
    pub version: u16,
    pub height: BlockHeight,
    pub prev_hash: CryptoHash,
    pub generator: Address,
    pub consensus_data: Vec<u8>,
}

/// Write access to the local chain and the block executor.
pub trait Committer: Send + Sync {
    /// Opaque executor handle carrying the post-state of a block that has not been connected yet.
    ///
    /// A formulator builds each block of its burst on a clone of the previous block's context, so cloning
    /// should be cheap, for example a handle to a copy-on-write overlay.
    type Context: Clone + Send + 'static;

    /// Incremental block builder used by formulators.
    type Creator: BlockCreator<Context = Self::Context>;

    /// Create a scratch context on top of the latest connected block.
    fn new_context(&self) -> Self::Context;

    /// The context hash that a header built on `context` must carry.
    fn context_hash(&self, context: &Self::Context) -> CryptoHash;

    /// Execute and connect `block` on top of the latest connected block.
    fn connect_block(
        &self,
        block: &Block,
        signer_hint: Option<&SignerHintMap>,
    ) -> Result<(), ChainError>;

    /// Connect `block` by applying a context previously computed for it with
    /// [`execute_block_on_context`](Self::execute_block_on_context) or by a [`BlockCreator`].
    fn connect_block_with_context(
        &self,
        block: &Block,
        context: Self::Context,
    ) -> Result<(), ChainError>;

    /// Execute the transactions of `block` on `context`.
    fn execute_block_on_context(
        &self,
        block: &Block,
        context: &mut Self::Context,
        signer_hint: Option<&SignerHintMap>,
    ) -> Result<(), ChainError>;

    /// Stateless and tip-relative header checks (chain id, version, height, previous hash).
    fn validate_header(&self, header: &Header) -> Result<(), ChainError>;

    /// Start building a block on top of `parent`, or on top of the latest connected block if `parent`
    /// is `None`.
    fn new_block_creator(
        &self,
        parent: Option<&Self::Context>,
        template: BlockTemplate,
    ) -> Result<Self::Creator, ChainError>;

    /// Persist process state under `tag`. Read back through [`Provider::process_data`].
    fn save_process_data(&self, tag: &[u8], value: Vec<u8>) -> Result<(), ChainError>;
}

/// Builds a single block transaction by transaction.
pub trait BlockCreator: Send {
    type Context;

    /// Remember the current state so a failing transaction can be rolled back with
    /// [`revert`](Self::revert).
    fn snapshot(&mut self) -> usize;

    fn revert(&mut self, snapshot: usize);

    /// Execute and include a transaction. On error, the caller reverts to the last snapshot.
    fn add_transaction(&mut self, item: &PoolItem) -> Result<(), ChainError>;

    fn transaction_count(&self) -> usize;

    /// Fix the timestamp, fill in the body and context hashes, and return the unsigned block along with
    /// its post-state.
    fn finalize(self, timestamp: Timestamp) -> Result<(Block, Self::Context), ChainError>;
}

/// A chain implementation usable by every node role.
pub trait Chain: Provider + Committer + Clone + 'static {}

impl<T: Provider + Committer + Clone + 'static> Chain for T {}

/// Failures reported by [`Provider`] and [`Committer`] implementations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// No block is stored at this height.
    BlockNotFound { height: BlockHeight },

    /// The header does not extend the local tip or is otherwise malformed.
    InvalidHeader { reason: String },

    /// A transaction was rejected by the executor.
    InvalidTransaction { reason: String },

    /// Executing the block produced a different context hash than the header claims.
    InvalidContextHash {
        expected: CryptoHash,
        computed: CryptoHash,
    },

    /// The underlying storage failed.
    Storage { reason: String },
}

impl Display for ChainError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::BlockNotFound { height } => write!(f, "block not found at height {}", height),
            ChainError::InvalidHeader { reason } => write!(f, "invalid header: {}", reason),
            ChainError::InvalidTransaction { reason } => write!(f, "invalid transaction: {}", reason),
            ChainError::InvalidContextHash { expected, computed } => write!(
                f,
                "invalid context hash: header has {}, execution produced {}",
                expected, computed
            ),
            ChainError::Storage { reason } => write!(f, "storage error: {}", reason),
        }
    }
}
