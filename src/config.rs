/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! User-defined parameters of observer and formulator nodes.
//!
//! Chain-wide constants live in [`ConsensusPolicy`], which every node of a chain must agree on. It is
//! passed explicitly to each node at construction time.
//!
//! The node-local parameters are built with the builder pattern, for example:
//!
//! ```ignore
//! let configuration =
//!     ObserverConfiguration::builder()
//!     .me(signing_key)
//!     .chain_id(ChainID::new(0))
//!     .policy(ConsensusPolicy::default())
//!     .log_events(true)
//!     .build();
//! ```
//!
//! Every parameter other than the key, the chain ID and (for formulators) the address has a default.

use std::thread;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

use crate::types::basic::{timestamp_now, Address, ChainID, Slot, Timestamp};

/// Constants that every node of a chain must agree on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsensusPolicy {
    /// Target time between two blocks.
    pub block_interval: Duration,

    /// Length of a transaction admission [`Slot`], in nanoseconds.
    pub slot_length_ns: u64,

    /// If set, phases in the rank table never lag more than this much behind the largest phase.
    pub max_phase_diff: Option<u32>,
}

impl Default for ConsensusPolicy {
    fn default() -> Self {
        ConsensusPolicy {
            block_interval: Duration::from_millis(500),
            slot_length_ns: 1_000_000_000,
            max_phase_diff: None,
        }
    }
}

impl ConsensusPolicy {
    pub fn slot_of(&self, timestamp: Timestamp) -> Slot {
        Slot::of(timestamp, self.slot_length_ns)
    }

    pub fn current_slot(&self) -> Slot {
        self.slot_of(timestamp_now())
    }
}

/// Stores the user-defined parameters required to start an observer.
///
/// ## Round timeout
///
/// The observer checks its voting round every `tick_interval`. If the round does not advance for
/// `round_timeout_ticks` ticks in a row, the chosen formulator is ignored for `ignore_duration`
/// (`repeat_ignore_duration` if it timed out again within `repeat_ignore_duration` of its previous
/// ignore), and a new round starts.
#[derive(Clone, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building an [ObserverConfiguration]. On the builder call the following methods
    to construct a valid [ObserverConfiguration].

    Required:
    - `.me(...)`
    - `.chain_id(...)`
"))]
pub struct ObserverConfiguration {
    #[builder(setter(doc = "Set the observer's keypair, used to sign votes. Required."))]
    pub me: SigningKey,
    #[builder(setter(doc = "Set the chain ID of the blockchain. Required."))]
    pub chain_id: ChainID,
    #[builder(default, setter(doc = "Set the chain-wide consensus constants."))]
    pub policy: ConsensusPolicy,
    #[builder(default = Duration::from_millis(100))]
    pub tick_interval: Duration,
    #[builder(default = 20)]
    pub round_timeout_ticks: u32,
    #[builder(default = Duration::from_secs(30))]
    pub ignore_duration: Duration,
    #[builder(default = Duration::from_secs(120))]
    pub repeat_ignore_duration: Duration,
    #[builder(default = Duration::from_millis(500), setter(doc = "Set how often an observer waiting for a block may ask other observers for it."))]
    pub block_gen_request_interval: Duration,
    #[builder(default = Duration::from_secs(10))]
    pub sync_request_timeout: Duration,
    #[builder(default = false, setter(doc = "Enable logging of events."))]
    pub log_events: bool,
}

/// Stores the user-defined parameters required to start a formulator.
#[derive(Clone, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [FormulatorConfiguration]. On the builder call the following methods
    to construct a valid [FormulatorConfiguration].

    Required:
    - `.me(...)`
    - `.address(...)`
    - `.chain_id(...)`
"))]
pub struct FormulatorConfiguration {
    #[builder(setter(doc = "Set the formulator's generator keypair, used to sign block headers. Required."))]
    pub me: SigningKey,
    #[builder(setter(doc = "Set the on-chain address of the formulator. Required."))]
    pub address: Address,
    #[builder(setter(doc = "Set the chain ID of the blockchain. Required."))]
    pub chain_id: ChainID,
    #[builder(default)]
    pub policy: ConsensusPolicy,
    #[builder(default = Duration::from_millis(200), setter(doc = "Set how long a block may spend collecting transactions."))]
    pub tx_loop_duration: Duration,
    #[builder(default = Duration::from_millis(200), setter(doc = "Set the target time between two blocks of a burst."))]
    pub block_gen_pace: Duration,
    #[builder(default = 5000)]
    pub max_transactions_per_block: usize,
    #[builder(default = 65536)]
    pub tx_pool_capacity: usize,
    #[builder(default = default_tx_workers())]
    pub tx_workers: usize,
    #[builder(default = 7, setter(doc = "Set how many node peers a new transaction is gossiped to."))]
    pub gossip_limit: usize,
    #[builder(default = Duration::from_millis(10))]
    pub commit_interval: Duration,
    #[builder(default = Duration::from_secs(10))]
    pub sync_request_timeout: Duration,
    #[builder(default = false, setter(doc = "Enable logging of events."))]
    pub log_events: bool,
}

fn default_tx_workers() -> usize {
    thread::available_parallelism()
        .map(|parallelism| parallelism.get())
        .unwrap_or(1)
}
