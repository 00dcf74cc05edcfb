/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The pluggable networking interface and the identities of peers on it.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{Address, PublicHash};

use super::messages::Message;

/// Identity of a peer, as authenticated by the connection handshake.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize,
)]
pub enum PeerID {
    /// An observer, identified by the public hash of its signing key.
    Observer(PublicHash),
    /// A formulator connected to an observer, identified by its on-chain address.
    Formulator(Address),
    /// Any other node of the formulator peer mesh (formulators and full nodes).
    Node(PublicHash),
}

impl PeerID {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            PeerID::Observer(public_hash) | PeerID::Node(public_hash) => public_hash.bytes().to_vec(),
            PeerID::Formulator(address) => address.bytes().to_vec(),
        }
    }

    pub fn is_observer(&self) -> bool {
        matches!(self, PeerID::Observer(_))
    }
}

impl Display for PeerID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PeerID::Observer(public_hash) => write!(f, "observer:{}", public_hash),
            PeerID::Formulator(address) => write!(f, "formulator:{}", address),
            PeerID::Node(public_hash) => write!(f, "node:{}", public_hash),
        }
    }
}

/// What a node learns from its network.
#[derive(Clone, Debug)]
pub enum PeerEvent {
    Connected(PeerID),
    Disconnected(PeerID),
    Message(PeerID, Message),
}

pub trait Network: Clone + Send {
    /// Send a message to the specified peer without blocking. Messages to unknown peers are dropped.
    fn send(&mut self, peer: PeerID, message: Message);

    /// Send a message to all connected peers without blocking.
    fn broadcast(&mut self, message: Message);

    /// Send a message to at most `limit` connected peers other than `except`, without blocking.
    ///
    /// Implementations should spread consecutive casts evenly over the peers, for example with a
    /// [`FanoutCursor`].
    fn except_cast_limit(&mut self, except: Option<PeerID>, message: Message, limit: usize);

    /// Close the session with `peer`, if any.
    fn remove_peer(&mut self, peer: PeerID);

    /// The peers with a live session.
    fn peers(&self) -> Vec<PeerID>;

    /// Receive an event from any peer. Returns immediately with a None if no event is available now.
    fn recv(&mut self) -> Option<PeerEvent>;
}

/// Deterministic rotation over a peer set, used to pick the targets of a limited cast.
///
/// Each cast starts where the previous one stopped, so over many casts every peer is picked about
/// equally often without any randomness.
#[derive(Clone, Debug, Default)]
pub struct FanoutCursor {
    position: usize,
}

impl FanoutCursor {
    pub fn new() -> FanoutCursor {
        FanoutCursor::default()
    }

    /// Pick at most `limit` of `peers`, never `except`.
    pub fn select(
        &mut self,
        peers: &[PeerID],
        except: Option<&PeerID>,
        limit: usize,
    ) -> Vec<PeerID> {
        let mut eligible: Vec<PeerID> = peers
            .iter()
            .filter(|peer| Some(*peer) != except)
            .copied()
            .collect();
        eligible.sort();
        eligible.dedup();
        if eligible.len() <= limit {
            return eligible;
        }

        let start = self.position % eligible.len();
        self.position = (start + limit) % eligible.len();
        eligible
            .iter()
            .cycle()
            .skip(start)
            .take(limit)
            .copied()
            .collect()
    }
}
