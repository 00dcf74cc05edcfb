/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of Proof-of-Formulator consensus.
//!
//! Two kinds of node take part in consensus:
//! 1. [Observers](observer) are a small, fixed committee. In every round they vote on which formulator
//!    produces the next blocks, and they certify the blocks it produces with their signatures.
//! 2. [Formulators](formulator) are the block producers. They are ranked in a [rank table](rank_table)
//!    that rotates deterministically with every block, collect transactions in a [pool](tx_pool), and
//!    produce a burst of blocks when elected.
//!
//! A block is final once it carries its generator's signature and the signatures of a quorum of
//! observers. Nodes that fall behind catch up through [block sync](block_sync).
//!
//! The library does not store blocks or execute transactions itself. Users plug in a [`chain::Chain`]
//! implementation, a [`networking::Network`] implementation (or use [`networking::PeerMesh`]), and a
//! [configuration](config).

pub mod types;

pub mod chain;

pub mod config;

pub mod consensus;

pub mod rank_table;

pub mod request_timer;

pub mod block_queue;

pub mod tx_pool;

pub mod observer;

pub mod formulator;

pub mod block_sync;

pub mod networking;

pub mod events;

pub(crate) mod event_bus;

pub(crate) mod logging;
