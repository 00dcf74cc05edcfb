/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable peer-to-peer (P2P) networking.
//!
//! Nodes talk to their peers through the [`Network`] trait. [`PeerMesh`] is a ready-made implementation
//! over TCP; applications may bring their own.

pub mod codec;

pub mod handshake;

pub mod mesh;

pub mod messages;

pub mod network;

pub(crate) mod receiving;

pub(crate) mod sending;

pub use mesh::{allow_nodes, allow_observers, Authorizer, MeshConfiguration, PeerMesh};
pub use messages::Message;
pub use network::{FanoutCursor, Network, PeerEvent, PeerID};
