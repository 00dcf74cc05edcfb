/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run an observer.
//!
//! Observers are the fixed set of nodes that decide, round by round, which formulator produces the next
//! blocks, and that certify those blocks with their signatures. The voting protocol itself is described
//! in [the implementation module](implementation).
//!
//! ## Starting an observer
//!
//! The chain passed in must already hold a consensus state, written by
//! [`initialize`](crate::consensus::initialize) at genesis. The network is expected to connect the
//! observer to every other observer as [`PeerID::Observer`], and to every formulator as
//! [`PeerID::Formulator`]; [`observer_authorizer`] decides the latter for a [`PeerMesh`](crate::networking::PeerMesh).
//!
//! ```ignore
//! let observer =
//!     ObserverSpec::builder()
//!     .chain(chain)
//!     .network(network)
//!     .configuration(configuration)
//!     .on_commit_block(commit_handler)
//!     .build()
//!     .start()?;
//! ```
//!
//! ### Required setters
//! - `.chain(...)`
//! - `.network(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! Handlers for the events in [crate::events] that an observer emits:
//! - `.on_commit_block(...)`
//! - `.on_consensus_halted(...)`
//! - `.on_invalid_context_hash(...)`
//! - `.on_start_round(...)`
//! - `.on_round_timeout(...)`
//! - `.on_ignore_formulator(...)`
//! - `.on_send_block_req(...)`
//! - `.on_receive_block_gen(...)`
//! - `.on_receive_blocks(...)`

pub mod messages;

pub(crate) mod implementation;

pub(crate) mod vote_round;

pub use implementation::ObserverError;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use typed_builder::TypedBuilder;

use crate::block_sync::start_block_sync;
use crate::chain::Chain;
use crate::config::ObserverConfiguration;
use crate::consensus::{Consensus, ConsensusState, HaltSignal};
use crate::event_bus::*;
use crate::events::*;
use crate::networking::receiving::start_polling;
use crate::networking::{Authorizer, Network, PeerID};
use crate::rank_table::Rank;
use crate::types::basic::{Address, BlockHeight};

use implementation::{lock_ignore_map, start_observer, IgnoreMap, ObserverProcess};

/// Stores all the parameters and trait implementations required to run an [Observer].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building an [ObserverSpec]. On the builder call the following methods to
    construct a valid [ObserverSpec].

    Required:
    - `.chain(...)`
    - `.network(...)`
    - `.configuration(...)`
"))]
pub struct ObserverSpec<C: Chain, N: Network + 'static> {
    #[builder(setter(doc = "Set the chain the observer commits blocks to. Required."))]
    chain: C,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. Required."))]
    network: N,
    #[builder(setter(doc = "Set the [configuration](ObserverConfiguration) of the observer. Required."))]
    configuration: ObserverConfiguration,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is committed. Optional."))]
    on_commit_block: Option<HandlerPtr<CommitBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ConsensusHaltedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ConsensusHaltedEvent>),
    doc = "Register a handler closure to be invoked after the observer halts. Optional."))]
    on_consensus_halted: Option<HandlerPtr<ConsensusHaltedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&InvalidContextHashEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<InvalidContextHashEvent>),
    doc = "Register a handler closure to be invoked after the observer rejects a block that executes to a different context hash than its header claims. Optional."))]
    on_invalid_context_hash: Option<HandlerPtr<InvalidContextHashEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartRoundEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartRoundEvent>),
    doc = "Register a handler closure to be invoked after the observer starts a voting round. Optional."))]
    on_start_round: Option<HandlerPtr<StartRoundEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RoundTimeoutEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RoundTimeoutEvent>),
    doc = "Register a handler closure to be invoked after a voting round times out. Optional."))]
    on_round_timeout: Option<HandlerPtr<RoundTimeoutEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&IgnoreFormulatorEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<IgnoreFormulatorEvent>),
    doc = "Register a handler closure to be invoked after the observer starts ignoring a formulator. Optional."))]
    on_ignore_formulator: Option<HandlerPtr<IgnoreFormulatorEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SendBlockReqEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SendBlockReqEvent>),
    doc = "Register a handler closure to be invoked after the observer asks a formulator for blocks. Optional."))]
    on_send_block_req: Option<HandlerPtr<SendBlockReqEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveBlockGenEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveBlockGenEvent>),
    doc = "Register a handler closure to be invoked after the observer accepts a proposed block. Optional."))]
    on_receive_block_gen: Option<HandlerPtr<ReceiveBlockGenEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveBlocksEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveBlocksEvent>),
    doc = "Register a handler closure to be invoked after the observer receives blocks while catching up. Optional."))]
    on_receive_blocks: Option<HandlerPtr<ReceiveBlocksEvent>>,
}

impl<C: Chain, N: Network + 'static> ObserverSpec<C, N> {
    /// Start the threads of the observer, and return the handle that keeps them alive.
    pub fn start(self) -> Result<Observer<C>, ObserverError> {
        let log_events = self.configuration.log_events;
        let event_handlers = EventHandlers {
            commit_block_handlers: handlers_with_logger(log_events, self.on_commit_block),
            consensus_halted_handlers: handlers_with_logger(log_events, self.on_consensus_halted),
            invalid_context_hash_handlers: handlers_with_logger(log_events, self.on_invalid_context_hash),
            start_round_handlers: handlers_with_logger(log_events, self.on_start_round),
            round_timeout_handlers: handlers_with_logger(log_events, self.on_round_timeout),
            ignore_formulator_handlers: handlers_with_logger(log_events, self.on_ignore_formulator),
            send_block_req_handlers: handlers_with_logger(log_events, self.on_send_block_req),
            receive_block_gen_handlers: handlers_with_logger(log_events, self.on_receive_block_gen),
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
            self.configuration.policy.clone(),
            HaltSignal::new(),
            event_publisher.clone(),
        )?;

        let close = Arc::new(AtomicBool::new(false));
        let (poller, messages, sync_events) = start_polling(self.network.clone(), close.clone());

        let block_sync = start_block_sync(
            consensus.clone(),
            self.network.clone(),
            sync_events,
            self.configuration.sync_request_timeout,
            close.clone(),
            event_publisher.clone(),
        );

        let ignore_map: IgnoreMap = Arc::new(Mutex::new(HashMap::new()));
        let process = ObserverProcess::new(
            &self.configuration,
            consensus.clone(),
            self.network,
            ignore_map.clone(),
            event_publisher,
        );
        let observer = start_observer(process, messages, close.clone());

        let event_bus = event_subscriber
            .map(|event_subscriber| start_event_bus(event_handlers, event_subscriber, close.clone()));

        Ok(Observer {
            consensus,
            ignore_map,
            close,
            poller: Some(poller),
            block_sync: Some(block_sync),
            observer: Some(observer),
            event_bus,
        })
    }
}

/// A handle to the background threads of an observer. When this value is dropped, all background threads
/// are gracefully shut down.
pub struct Observer<C: Chain> {
    consensus: Consensus<C>,
    ignore_map: IgnoreMap,
    close: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
    block_sync: Option<JoinHandle<()>>,
    observer: Option<JoinHandle<()>>,
    event_bus: Option<JoinHandle<()>>,
}

impl<C: Chain> Observer<C> {
    pub fn height(&self) -> BlockHeight {
        self.consensus.chain().height()
    }

    /// The consensus state at the current tip.
    pub fn consensus_state(&self) -> ConsensusState {
        self.consensus.snapshot()
    }

    /// The best ranked formulators this observer would currently vote for, at most `limit` of them.
    pub fn candidates(&self, limit: usize) -> Vec<Rank> {
        let ignored = self.ignored_formulators();
        let state = self.consensus.snapshot();
        let active: HashSet<Address> = state
            .rank_table()
            .candidates()
            .iter()
            .map(|rank| rank.address)
            .filter(|address| !ignored.contains(address))
            .collect();
        state.rank_table().ranks_in_map(&active, limit)
    }

    /// Formulators that timed out recently and are skipped when voting.
    pub fn ignored_formulators(&self) -> Vec<Address> {
        let now = Instant::now();
        let mut ignored: Vec<Address> = lock_ignore_map(&self.ignore_map)
            .iter()
            .filter(|(_, until)| **until > now)
            .map(|(address, _)| *address)
            .collect();
        ignored.sort();
        ignored
    }

    pub fn is_halted(&self) -> bool {
        self.consensus.is_halted()
    }

    /// Why the observer halted, if it did.
    pub fn halt_reason(&self) -> Option<String> {
        self.consensus.halt_signal().reason()
    }
}

impl<C: Chain> Drop for Observer<C> {
    fn drop(&mut self) {
        self.close.store(true, Ordering::Release);

        // Consumers first, so nothing is left blocked on the poller's channels.
        for thread in [
            self.observer.take(),
            self.block_sync.take(),
            self.event_bus.take(),
            self.poller.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = thread.join();
        }
    }
}

/// An [`Authorizer`] for an observer's [`PeerMesh`](crate::networking::PeerMesh).
///
/// Peers that present an address are admitted as [`PeerID::Formulator`] if the address and key match a
/// formulator of the rank table at the current tip. Other peers are admitted only if they are observers.
/// The consensus state is read from `chain` on every handshake, so formulators that join the rank table
/// later are admitted too.
pub fn observer_authorizer<C: Chain>(chain: C) -> Authorizer {
    Arc::new(move |public_hash, address| {
        let state = ConsensusState::load(&chain).ok().flatten()?;
        match address {
            Some(address) => state
                .rank_table()
                .is_formulator(address, public_hash)
                .then_some(PeerID::Formulator(*address)),
            None => state
                .is_observer(public_hash)
                .then_some(PeerID::Observer(*public_hash)),
        }
    })
}
