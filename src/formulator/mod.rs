/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a formulator.
//!
//! Formulators are the block producers of the chain. A formulator holds a pool of pending transactions
//! that it gossips with the other formulators and nodes, and when the observers elect it, it produces a
//! burst of blocks from that pool. How a burst is generated and committed is described in
//! [the implementation module](implementation).
//!
//! ## Starting a formulator
//!
//! The formulator must be connected to every observer as [`PeerID::Observer`], and to the nodes it
//! gossips transactions with as [`PeerID::Node`]. [`formulator_authorizer`] does this for a
//! [`PeerMesh`](crate::networking::PeerMesh).
//!
//! ```ignore
//! let formulator =
//!     FormulatorSpec::builder()
//!     .chain(chain)
//!     .network(network)
//!     .configuration(configuration)
//!     .on_generate_block(generate_handler)
//!     .build()
//!     .start()?;
//!
//! formulator.push_transaction(0, transaction, signatures)?;
//! ```
//!
//! ### Required setters
//! - `.chain(...)`
//! - `.network(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! Handlers for the events in [crate::events] that a formulator emits:
//! - `.on_commit_block(...)`
//! - `.on_consensus_halted(...)`
//! - `.on_invalid_context_hash(...)`
//! - `.on_generate_block(...)`
//! - `.on_receive_ob_sign(...)`
//! - `.on_receive_blocks(...)`
//!
//! And a handler for transactions that expire from the pool without being included in a block:
//! - `.on_expire_transactions(...)`

pub mod messages;

pub(crate) mod implementation;

pub use implementation::FormulatorError;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use typed_builder::TypedBuilder;

use crate::block_sync::start_block_sync;
use crate::chain::Chain;
use crate::config::FormulatorConfiguration;
use crate::consensus::{Consensus, ConsensusState, HaltSignal};
use crate::event_bus::*;
use crate::events::*;
use crate::networking::receiving::start_polling;
use crate::networking::sending::SenderHandle;
use crate::networking::{Authorizer, Network, PeerID};
use crate::tx_pool::workers::{admit, start_tx_workers, TxJob};
use crate::tx_pool::TxPool;
use crate::types::basic::{BlockHeight, ChainID, CryptoHash};
use crate::types::block::{Transaction, TxType};
use crate::types::crypto_primitives::{Keypair, RecoverableSignature};

use implementation::*;
use messages::TransactionMessage;

/// Stores all the parameters and trait implementations required to run a [Formulator].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [FormulatorSpec]. On the builder call the following methods to
    construct a valid [FormulatorSpec].

    Required:
    - `.chain(...)`
    - `.network(...)`
    - `.configuration(...)`
"))]
pub struct FormulatorSpec<C: Chain, N: Network + 'static> {
    #[builder(setter(doc = "Set the chain the formulator builds on. Required."))]
    chain: C,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. Required."))]
    network: N,
    #[builder(setter(doc = "Set the [configuration](FormulatorConfiguration) of the formulator. Required."))]
    configuration: FormulatorConfiguration,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitBlockEvent>),
    doc = "Register a handler closure to be invoked after one of the formulator's blocks is committed. Optional."))]
    on_commit_block: Option<HandlerPtr<CommitBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ConsensusHaltedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ConsensusHaltedEvent>),
    doc = "Register a handler closure to be invoked after the formulator halts. Optional."))]
    on_consensus_halted: Option<HandlerPtr<ConsensusHaltedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&InvalidContextHashEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<InvalidContextHashEvent>),
    doc = "Register a handler closure to be invoked after the formulator rejects a block that executes to a different context hash than its header claims. Optional."))]
    on_invalid_context_hash: Option<HandlerPtr<InvalidContextHashEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&GenerateBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<GenerateBlockEvent>),
    doc = "Register a handler closure to be invoked after the formulator sends a new block to the observers. Optional."))]
    on_generate_block: Option<HandlerPtr<GenerateBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveObSignEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveObSignEvent>),
    doc = "Register a handler closure to be invoked after the formulator receives the observer signatures of a block. Optional."))]
    on_receive_ob_sign: Option<HandlerPtr<ReceiveObSignEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveBlocksEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveBlocksEvent>),
    doc = "Register a handler closure to be invoked after the formulator receives blocks while catching up. Optional."))]
    on_receive_blocks: Option<HandlerPtr<ReceiveBlocksEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&[Transaction]) + Send + 'static| Some(Box::new(handler) as ExpirationHandler),
    doc = "Register a handler closure to be invoked with the transactions that expire from the pool. Optional."))]
    on_expire_transactions: Option<ExpirationHandler>,
}

impl<C: Chain, N: Network + 'static> FormulatorSpec<C, N> {
    /// Start the threads of the formulator, and return the handle that keeps them alive.
    pub fn start(self) -> Result<Formulator<C>, FormulatorError> {
        let configuration = self.configuration;
        let log_events = configuration.log_events;
        let event_handlers = EventHandlers {
            commit_block_handlers: handlers_with_logger(log_events, self.on_commit_block),
            consensus_halted_handlers: handlers_with_logger(log_events, self.on_consensus_halted),
            invalid_context_hash_handlers: handlers_with_logger(log_events, self.on_invalid_context_hash),
            generate_block_handlers: handlers_with_logger(log_events, self.on_generate_block),
            receive_ob_sign_handlers: handlers_with_logger(log_events, self.on_receive_ob_sign),
            receive_blocks_handlers: handlers_with_logger(log_events, self.on_receive_blocks),
            ..Default::default()
        };
        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let consensus = Consensus::load(
            self.chain,
            configuration.policy.clone(),
            HaltSignal::new(),
            event_publisher.clone(),
        )?;
        let tx_pool = Arc::new(TxPool::new(
            configuration.policy.slot_length_ns,
            configuration.tx_pool_capacity,
        ));

        let close = Arc::new(AtomicBool::new(false));
        let (poller, messages, sync_events) = start_polling(self.network.clone(), close.clone());

        let block_sync = start_block_sync(
            consensus.clone(),
            self.network.clone(),
            sync_events,
            configuration.sync_request_timeout,
            close.clone(),
            event_publisher.clone(),
        );

        let last_req = Arc::new(Mutex::new(None));
        let gen_items: GenItemMap<C::Context> = Arc::new(Mutex::new(BTreeMap::new()));
        let (request_sender, request_receiver) = mpsc::channel();
        let (job_sender, job_receiver) = mpsc::channel();
        let (admitted_sender, admitted_receiver) = mpsc::channel::<TxJob>();

        let gossip = start_gossip(
            self.network.clone(),
            admitted_receiver,
            configuration.gossip_limit,
            close.clone(),
        );

        let on_admitted = {
            let admitted_sender = admitted_sender.clone();
            move |job: TxJob| {
                let _ = admitted_sender.send(job);
            }
        };
        let tx_workers = start_tx_workers(
            configuration.tx_workers,
            tx_pool.clone(),
            configuration.chain_id,
            configuration.policy.slot_length_ns,
            job_receiver,
            close.clone(),
            on_admitted,
        );

        let dispatcher = start_dispatcher(
            Dispatcher {
                consensus: consensus.clone(),
                address: configuration.address,
                public_hash: Keypair::new(configuration.me.clone()).public_hash(),
                last_req: last_req.clone(),
                requests: request_sender,
                gen_items: gen_items.clone(),
                tx_jobs: job_sender,
                event_publisher: event_publisher.clone(),
            },
            messages,
            close.clone(),
        );

        let generator = start_generator(
            Generator::new(
                &configuration,
                consensus.clone(),
                self.network.clone(),
                tx_pool.clone(),
                last_req.clone(),
                gen_items.clone(),
                event_publisher.clone(),
            ),
            request_receiver,
            close.clone(),
        );

        let committer = start_committer(
            BlockCommitter {
                consensus: consensus.clone(),
                sender: SenderHandle::new(self.network),
                chain_id: configuration.chain_id,
                address: configuration.address,
                tx_pool: tx_pool.clone(),
                last_req,
                gen_items,
                expiration_handler: self.on_expire_transactions,
                seen_height: consensus.chain().height(),
                event_publisher,
            },
            configuration.commit_interval,
            close.clone(),
        );

        let event_bus = event_subscriber
            .map(|event_subscriber| start_event_bus(event_handlers, event_subscriber, close.clone()));

        Ok(Formulator {
            consensus,
            tx_pool,
            chain_id: configuration.chain_id,
            gossip_sender: admitted_sender,
            close,
            poller: Some(poller),
            block_sync: Some(block_sync),
            dispatcher: Some(dispatcher),
            generator: Some(generator),
            committer: Some(committer),
            tx_workers,
            gossip: Some(gossip),
            event_bus,
        })
    }
}

/// A handle to the background threads of a formulator. When this value is dropped, all background threads
/// are gracefully shut down.
pub struct Formulator<C: Chain> {
    consensus: Consensus<C>,
    tx_pool: Arc<TxPool>,
    chain_id: ChainID,
    gossip_sender: Sender<TxJob>,
    close: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
    block_sync: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    generator: Option<JoinHandle<()>>,
    committer: Option<JoinHandle<()>>,
    tx_workers: Vec<JoinHandle<()>>,
    gossip: Option<JoinHandle<()>>,
    event_bus: Option<JoinHandle<()>>,
}

impl<C: Chain> Formulator<C> {
    /// Admit a locally submitted transaction into the pool, and gossip it to peers.
    ///
    /// Returns the hash of the transaction, or why it was not admitted.
    pub fn push_transaction(
        &self,
        tx_type: TxType,
        transaction: Transaction,
        signatures: Vec<RecoverableSignature>,
    ) -> Result<CryptoHash, FormulatorError> {
        let message = TransactionMessage {
            tx_type,
            transaction,
            signatures,
        };
        let tx_hash = admit(
            &self.tx_pool,
            self.chain_id,
            self.consensus.policy().current_slot(),
            &message,
        )?;
        let _ = self.gossip_sender.send(TxJob {
            origin: None,
            message,
        });
        Ok(tx_hash)
    }

    pub fn height(&self) -> BlockHeight {
        self.consensus.chain().height()
    }

    /// The consensus state at the current tip.
    pub fn consensus_state(&self) -> ConsensusState {
        self.consensus.snapshot()
    }

    /// Number of transactions waiting in the pool.
    pub fn tx_pool_len(&self) -> usize {
        self.tx_pool.len()
    }

    pub fn is_halted(&self) -> bool {
        self.consensus.is_halted()
    }

    /// Why the formulator halted, if it did.
    pub fn halt_reason(&self) -> Option<String> {
        self.consensus.halt_signal().reason()
    }
}

impl<C: Chain> Drop for Formulator<C> {
    fn drop(&mut self) {
        self.close.store(true, Ordering::Release);

        for thread in [
            self.dispatcher.take(),
            self.generator.take(),
            self.committer.take(),
        ]
        .into_iter()
        .flatten()
        .chain(self.tx_workers.drain(..))
        .chain(
            [
                self.gossip.take(),
                self.block_sync.take(),
                self.event_bus.take(),
                self.poller.take(),
            ]
            .into_iter()
            .flatten(),
        ) {
            let _ = thread.join();
        }
    }
}

/// An [`Authorizer`] for a formulator's [`PeerMesh`](crate::networking::PeerMesh).
///
/// Observers of the consensus state at the current tip are admitted as [`PeerID::Observer`], every other
/// peer as [`PeerID::Node`].
pub fn formulator_authorizer<C: Chain>(chain: C) -> Authorizer {
    Arc::new(move |public_hash, _| {
        let is_observer = ConsensusState::load(&chain)
            .ok()
            .flatten()
            .map_or(false, |state| state.is_observer(public_hash));
        if is_observer {
            Some(PeerID::Observer(*public_hash))
        } else {
            Some(PeerID::Node(*public_hash))
        }
    })
}
