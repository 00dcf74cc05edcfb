/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The threads of a formulator.
//!
//! ## Generating a burst
//!
//! When the observers elect this formulator, their leader sends it a [`BlockReqMessage`]. The generator
//! thread then produces every block the formulator's turn allows, one after another, each on top of the
//! previous one:
//! 1. Fill the block from the [`TxPool`] for at most `tx_loop_duration`, holding the pool's lock so that
//!    admission never interleaves with the proposer. A transaction the chain rejects is rolled back and
//!    dropped.
//! 2. Finalize the block, sign its header, and send it to every observer as a [`BlockGenMessage`].
//! 3. Keep the block and its post-state until the observers certify it.
//! 4. Sleep to keep the burst close to one block per `block_gen_pace`.
//!
//! A burst stops early when another request replaces it, or when the chain moves past the height the
//! burst is about to produce.
//!
//! ## Committing
//!
//! The leader observer returns every certified block's observer signatures in a [`BlockObSignMessage`].
//! The committer thread connects kept blocks in height order as soon as their signatures are in, and
//! broadcasts the new tip.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crate::block_sync::server::local_status;
use crate::chain::{BlockCreator, BlockTemplate, Chain, ChainError, Committer, Provider, SignerHintMap};
use crate::config::FormulatorConfiguration;
use crate::consensus::{
    validate_block_certificate, validate_block_signatures, Consensus, ConsensusError, ConsensusState,
};
use crate::events::*;
use crate::networking::messages::Message;
use crate::networking::network::{Network, PeerID};
use crate::networking::sending::SenderHandle;
use crate::observer::messages::{BlockGenMessage, BlockObSignMessage, BlockReqMessage};
use crate::tx_pool::workers::TxJob;
use crate::tx_pool::{AdmissionError, TxPool};
use crate::types::basic::{timestamp_now, Address, BlockHeight, ChainID, PublicHash, Timestamp};
use crate::types::block::{Block, Header, Transaction};
use crate::types::crypto_primitives::Keypair;

/// Blocks of a burst after this many get an extra `block_gen_pace` of slack each.
const PACED_BLOCKS: u32 = 9;

pub(crate) type ExpirationHandler = Box<dyn Fn(&[Transaction]) + Send>;

/// A generated block waiting for its certificate.
pub(crate) struct GenItem<X> {
    pub(crate) block_gen: BlockGenMessage,
    pub(crate) context: Option<X>,
    pub(crate) signer_hint: SignerHintMap,
    pub(crate) ob_sign: Option<BlockObSignMessage>,
}

/// Generated blocks by height, shared by the generator, the dispatcher and the committer.
pub(crate) type GenItemMap<X> = Arc<Mutex<BTreeMap<BlockHeight, GenItem<X>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Check that a block request addresses this formulator, extends the local tip, and names the formulator
/// the rank table expects at its timeout count.
pub(crate) fn validate_block_req<C: Chain>(
    consensus: &Consensus<C>,
    address: &Address,
    public_hash: &PublicHash,
    request: &BlockReqMessage,
) -> Result<(), FormulatorError> {
    let (height, last_hash) = consensus.chain().last_status();
    if request.formulator != *address
        || request.formulator_public_hash != *public_hash
        || request.prev_hash != last_hash
        || request.target_height != height.next()
    {
        return Err(FormulatorError::InvalidRequest);
    }
    let top = consensus
        .snapshot()
        .rank_table()
        .top_rank(request.timeout_count)
        .map_err(ConsensusError::from)?;
    if top.address != *address {
        return Err(FormulatorError::InvalidRequest);
    }
    Ok(())
}

/// Hands consensus messages from the poller to the generator, the certificate map and the transaction
/// workers.
pub(crate) struct Dispatcher<C: Chain> {
    pub(crate) consensus: Consensus<C>,
    pub(crate) address: Address,
    pub(crate) public_hash: PublicHash,
    pub(crate) last_req: Arc<Mutex<Option<BlockReqMessage>>>,
    pub(crate) requests: Sender<BlockReqMessage>,
    pub(crate) gen_items: GenItemMap<C::Context>,
    pub(crate) tx_jobs: Sender<TxJob>,
    pub(crate) event_publisher: Option<Sender<Event>>,
}

impl<C: Chain> Dispatcher<C> {
    pub(crate) fn on_message(&mut self, origin: PeerID, message: Message) {
        let result = match message {
            Message::BlockReq(request) => self.on_block_req(origin, request),
            Message::BlockObSign(ob_sign) => self.on_block_ob_sign(origin, ob_sign),
            Message::Transaction(message) => {
                let _ = self.tx_jobs.send(TxJob {
                    origin: Some(origin),
                    message,
                });
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(error) = result {
            log::debug!("dropped message from {}: {}", origin, error);
        }
    }

    fn on_block_req(&mut self, origin: PeerID, request: BlockReqMessage) -> Result<(), FormulatorError> {
        if !origin.is_observer() || self.consensus.is_halted() {
            return Err(FormulatorError::InvalidRequest);
        }
        validate_block_req(&self.consensus, &self.address, &self.public_hash, &request)?;

        let mut last_req = lock(&self.last_req);
        if last_req.as_ref() == Some(&request) {
            return Ok(());
        }
        *last_req = Some(request.clone());
        drop(last_req);
        let _ = self.requests.send(request);
        Ok(())
    }

    fn on_block_ob_sign(
        &mut self,
        origin: PeerID,
        ob_sign: BlockObSignMessage,
    ) -> Result<(), FormulatorError> {
        let observer = match origin {
            PeerID::Observer(observer) => observer,
            _ => return Ok(()),
        };

        let mut gen_items = lock(&self.gen_items);
        let height = ob_sign.target_height;
        let item = match gen_items.get_mut(&height) {
            Some(item) => item,
            None => return Ok(()),
        };
        if item.block_gen.block_sign() != ob_sign.block_sign {
            log::debug!("ignoring a certificate for another block at {}", height);
            return Ok(());
        }
        validate_block_certificate(
            &self.consensus.state(),
            &with_certificate(&item.block_gen, &ob_sign),
        )?;

        Event::ReceiveObSign(ReceiveObSignEvent {
            timestamp: SystemTime::now(),
            origin: observer,
            block: ob_sign.block_sign.header_hash,
            height,
            signatures: ob_sign.observer_signatures.len(),
        })
        .publish(&self.event_publisher);
        item.ob_sign = Some(ob_sign);
        Ok(())
    }
}

/// `block_gen`'s block carrying the generator signature followed by the observer signatures of `ob_sign`.
fn with_certificate(block_gen: &BlockGenMessage, ob_sign: &BlockObSignMessage) -> Block {
    let mut block = block_gen.block.clone();
    block.signatures = std::iter::once(block_gen.generator_signature)
        .chain(ob_sign.observer_signatures.iter().copied())
        .collect();
    block
}

/// The kept block at `height` with its certificate attached, together with its context and signer
/// hints, if the certificate is valid against `state`.
///
/// An invalid certificate is dropped but the block is kept, so that a later certificate can still
/// complete it.
pub(crate) fn certified_item<X: Clone>(
    gen_items: &GenItemMap<X>,
    height: BlockHeight,
    state: &ConsensusState,
) -> Option<(Block, Option<X>, SignerHintMap)> {
    let mut gen_items = lock(gen_items);
    let item = gen_items.get_mut(&height)?;
    let block = with_certificate(&item.block_gen, item.ob_sign.as_ref()?);
    if let Err(error) = validate_block_signatures(state, &block) {
        log::warn!("certificate for block {} rejected: {}", height, error);
        item.ob_sign = None;
        return None;
    }
    Some((block, item.context.clone(), item.signer_hint.clone()))
}

pub(crate) fn start_dispatcher<C: Chain>(
    mut dispatcher: Dispatcher<C>,
    messages: Receiver<(PeerID, Message)>,
    close: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !close.load(Ordering::Acquire) {
            match messages.recv_timeout(Duration::from_millis(50)) {
                Ok((origin, message)) => dispatcher.on_message(origin, message),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    })
}

/// Produces the blocks of this formulator's turns. Runs on a single thread, so at most one burst is in
/// flight at a time.
pub(crate) struct Generator<C: Chain, N: Network> {
    pub(crate) consensus: Consensus<C>,
    pub(crate) sender: SenderHandle<N>,
    pub(crate) keypair: Keypair,
    pub(crate) address: Address,
    pub(crate) chain_id: ChainID,
    pub(crate) tx_pool: Arc<TxPool>,
    pub(crate) tx_loop_duration: Duration,
    pub(crate) block_gen_pace: Duration,
    pub(crate) max_transactions_per_block: usize,
    pub(crate) last_req: Arc<Mutex<Option<BlockReqMessage>>>,
    pub(crate) gen_items: GenItemMap<C::Context>,
    pub(crate) event_publisher: Option<Sender<Event>>,
}

impl<C: Chain, N: Network> Generator<C, N> {
    pub(crate) fn new(
        configuration: &FormulatorConfiguration,
        consensus: Consensus<C>,
        network: N,
        tx_pool: Arc<TxPool>,
        last_req: Arc<Mutex<Option<BlockReqMessage>>>,
        gen_items: GenItemMap<C::Context>,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        Self {
            consensus,
            sender: SenderHandle::new(network),
            keypair: Keypair::new(configuration.me.clone()),
            address: configuration.address,
            chain_id: configuration.chain_id,
            tx_pool,
            tx_loop_duration: configuration.tx_loop_duration,
            block_gen_pace: configuration.block_gen_pace,
            max_transactions_per_block: configuration.max_transactions_per_block,
            last_req,
            gen_items,
            event_publisher,
        }
    }

    fn is_current(&self, request: &BlockReqMessage) -> bool {
        lock(&self.last_req).as_ref() == Some(request)
    }

    /// Produce, send and keep the blocks of the turn that `request` starts.
    pub(crate) fn generate_burst(&mut self, request: &BlockReqMessage) -> Result<(), FormulatorError> {
        if self.consensus.is_halted() {
            return Err(ConsensusError::Halted.into());
        }
        validate_block_req(
            &self.consensus,
            &self.address,
            &self.keypair.public_hash(),
            request,
        )?;

        let remain_blocks = self.consensus.snapshot().remain_blocks(request.timeout_count);
        let pace_ns = self.block_gen_pace.as_nanos() as u64;
        let start_time = Instant::now();
        let start = timestamp_now();
        let end = start.saturating_add(pace_ns.saturating_mul(remain_blocks as u64));

        lock(&self.gen_items).retain(|height, _| *height < request.target_height);

        let mut parent: Option<C::Context> = None;
        let mut prev_hash = request.prev_hash;
        let mut prev_timestamp = self.consensus.chain().last_timestamp();
        for index in 0..remain_blocks {
            let height = request.target_height + index;
            if !self.is_current(request) || self.consensus.chain().height() >= height {
                log::debug!("burst from {} stopped before block {}", request.target_height, height);
                break;
            }

            let timestamp = start
                .saturating_add(pace_ns.saturating_mul(index as u64))
                .min(end)
                .max(prev_timestamp + 1);
            let timeout_count = if index == 0 { request.timeout_count } else { 0 };
            let template = BlockTemplate {
                chain_id: self.chain_id,
                version: self.consensus.chain().version(),
                height,
                prev_hash,
                generator: self.address,
                consensus_data: Header::encode_consensus_data(timeout_count),
            };

            let (block, context, signer_hint) = self.build_block(parent.as_ref(), template, timestamp)?;
            let block_gen = BlockGenMessage {
                generator_signature: self.keypair.sign(&block.hash()),
                block,
                is_reply: false,
            };
            self.sender.broadcast_to_observers(block_gen.clone());

            prev_hash = block_gen.block.hash();
            prev_timestamp = block_gen.block.header.timestamp;
            Event::GenerateBlock(GenerateBlockEvent {
                timestamp: SystemTime::now(),
                block: prev_hash,
                height,
                transactions: block_gen.block.transactions.len(),
            })
            .publish(&self.event_publisher);

            lock(&self.gen_items).insert(
                height,
                GenItem {
                    block_gen,
                    context: Some(context.clone()),
                    signer_hint,
                    ob_sign: None,
                },
            );
            parent = Some(context);

            self.pace(index, start_time);
        }
        Ok(())
    }

    /// Fill a block with transactions from the pool, and finalize it.
    fn build_block(
        &self,
        parent: Option<&C::Context>,
        template: BlockTemplate,
        timestamp: Timestamp,
    ) -> Result<(Block, C::Context, SignerHintMap), FormulatorError> {
        let chain = self.consensus.chain();
        let mut creator = chain.new_block_creator(parent, template)?;
        let mut signer_hint = SignerHintMap::new();

        let deadline = Instant::now() + self.tx_loop_duration;
        let current_slot = self.consensus.policy().current_slot();
        let mut pool = self.tx_pool.lock();
        while Instant::now() < deadline && creator.transaction_count() < self.max_transactions_per_block {
            let item = match pool.unsafe_pop(current_slot) {
                Some(item) => item,
                None => break,
            };
            let snapshot = creator.snapshot();
            match creator.add_transaction(&item) {
                Ok(()) => {
                    signer_hint.insert(item.tx_hash, item.signers);
                }
                Err(error) => {
                    creator.revert(snapshot);
                    log::debug!("dropped transaction {}: {}", item.tx_hash, error);
                }
            }
        }
        drop(pool);

        let (block, context) = creator.finalize(timestamp)?;
        Ok((block, context, signer_hint))
    }

    /// Sleep until the burst is `block_gen_pace` per block behind its start. Blocks past the first few
    /// get an extra `block_gen_pace` each, so long bursts leave observers room to catch up.
    fn pace(&self, index: u32, start_time: Instant) {
        let mut target = self.block_gen_pace * (index + 1);
        if index >= PACED_BLOCKS {
            target += self.block_gen_pace * (index + 1 - PACED_BLOCKS);
        }
        let elapsed = start_time.elapsed();
        if elapsed < target {
            thread::sleep(target - elapsed);
        }
    }
}

pub(crate) fn start_generator<C: Chain, N: Network + 'static>(
    mut generator: Generator<C, N>,
    requests: Receiver<BlockReqMessage>,
    close: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !close.load(Ordering::Acquire) {
            match requests.recv_timeout(Duration::from_millis(50)) {
                Ok(request) => {
                    if !generator.is_current(&request) {
                        continue;
                    }
                    if let Err(error) = generator.generate_burst(&request) {
                        log::warn!(
                            "failed to generate blocks from {}: {}",
                            request.target_height,
                            error
                        );
                    }
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    })
}

/// Connects certified blocks and keeps the transaction pool in step with the chain.
pub(crate) struct BlockCommitter<C: Chain, N: Network> {
    pub(crate) consensus: Consensus<C>,
    pub(crate) sender: SenderHandle<N>,
    pub(crate) chain_id: ChainID,
    pub(crate) address: Address,
    pub(crate) tx_pool: Arc<TxPool>,
    pub(crate) last_req: Arc<Mutex<Option<BlockReqMessage>>>,
    pub(crate) gen_items: GenItemMap<C::Context>,
    pub(crate) expiration_handler: Option<ExpirationHandler>,
    pub(crate) seen_height: BlockHeight,
    pub(crate) event_publisher: Option<Sender<Event>>,
}

impl<C: Chain, N: Network> BlockCommitter<C, N> {
    /// Connect kept blocks for as long as the block after the tip is certified.
    pub(crate) fn try_commit(&mut self) {
        while !self.consensus.is_halted() {
            let tip = self.consensus.chain().height();
            let next = tip.next();
            lock(&self.gen_items).retain(|height, _| *height > tip);
            let (block, context, signer_hint) =
                match certified_item(&self.gen_items, next, &self.consensus.snapshot()) {
                    Some(certified) => certified,
                    None => break,
                };

            match self.consensus.commit(&block, context, Some(&signer_hint)) {
                Ok(()) => {
                    lock(&self.gen_items).remove(&next);
                    self.on_committed(&block);
                }
                Err(ConsensusError::AlreadyConnected(_)) => {
                    lock(&self.gen_items).remove(&next);
                }
                Err(error) if error.is_fatal() => {
                    self.consensus.halt(error.to_string());
                    break;
                }
                Err(error) => {
                    log::warn!("failed to commit block {}: {}", next, error);
                    if let Some(item) = lock(&self.gen_items).get_mut(&next) {
                        item.ob_sign = None;
                    }
                    break;
                }
            }
        }
        self.follow_tip();
    }

    fn on_committed(&mut self, block: &Block) {
        log::debug!("committed block {} at {}", block.hash(), block.height());
        self.sender.broadcast(local_status(self.consensus.chain()));
        Event::CommitBlock(CommitBlockEvent {
            timestamp: SystemTime::now(),
            block: block.hash(),
            height: block.height(),
            generator: block.header.generator,
            transactions: block.transactions.len(),
        })
        .publish(&self.event_publisher);
    }

    /// Drop the transactions of newly connected blocks from the pool, whoever connected them, and evict
    /// the slots that fell out of the admission window.
    fn follow_tip(&mut self) {
        let chain = self.consensus.chain();
        let tip = chain.height();
        if tip <= self.seen_height {
            return;
        }

        let mut height = self.seen_height.next();
        while height <= tip {
            if let Ok(block) = chain.block(height) {
                if block.header.generator != self.address {
                    lock(&self.last_req).take();
                }
                for (tx_type, transaction) in block.transaction_types.iter().zip(&block.transactions) {
                    self.tx_pool.remove(&transaction.hash(self.chain_id, *tx_type));
                }
            }
            height = height.next();
        }
        self.seen_height = tip;

        let expired = self.tx_pool.clean(self.consensus.policy().current_slot());
        if !expired.is_empty() {
            log::debug!("{} transactions expired from the pool", expired.len());
            if let Some(handler) = &self.expiration_handler {
                handler(&expired);
            }
        }
    }
}

pub(crate) fn start_committer<C: Chain, N: Network + 'static>(
    mut committer: BlockCommitter<C, N>,
    commit_interval: Duration,
    close: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !close.load(Ordering::Acquire) {
            committer.try_commit();
            thread::sleep(commit_interval);
        }
    })
}

/// Forward admitted transactions to at most `gossip_limit` peers, never back to the peer they came from.
pub(crate) fn start_gossip<N: Network + 'static>(
    network: N,
    admitted: Receiver<TxJob>,
    gossip_limit: usize,
    close: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut sender = SenderHandle::new(network);
        while !close.load(Ordering::Acquire) {
            match admitted.recv_timeout(Duration::from_millis(50)) {
                Ok(job) => sender.except_cast_limit(job.origin, job.message, gossip_limit),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    })
}

#[derive(Debug)]
pub enum FormulatorError {
    /// A block request does not match the local tip or rank table.
    InvalidRequest,
    Admission(AdmissionError),
    Consensus(ConsensusError),
}

impl From<AdmissionError> for FormulatorError {
    fn from(error: AdmissionError) -> Self {
        FormulatorError::Admission(error)
    }
}

impl From<ConsensusError> for FormulatorError {
    fn from(error: ConsensusError) -> Self {
        FormulatorError::Consensus(error)
    }
}

impl From<ChainError> for FormulatorError {
    fn from(error: ChainError) -> Self {
        FormulatorError::Consensus(error.into())
    }
}

impl Display for FormulatorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FormulatorError::InvalidRequest => write!(f, "block request does not match the local view"),
            FormulatorError::Admission(error) => write!(f, "{}", error),
            FormulatorError::Consensus(error) => write!(f, "{}", error),
        }
    }
}
