/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions and types for sending messages to the P2P network.

use super::{
    messages::Message,
    network::{Network, PeerID},
};

/// Handle for sending and broadcasting messages to the [`Network`].
///
/// It can be used to send or broadcast instances of any type that implement the [`Into<Message>`]
/// trait.
#[derive(Clone)]
pub(crate) struct SenderHandle<N: Network> {
    network: N,
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(network: N) -> Self {
        Self { network }
    }

    pub(crate) fn send<S: Into<Message>>(&mut self, peer: PeerID, msg: S) {
        self.network.send(peer, msg.into())
    }

    pub(crate) fn broadcast<S: Into<Message>>(&mut self, msg: S) {
        self.network.broadcast(msg.into())
    }

    pub(crate) fn except_cast_limit<S: Into<Message>>(
        &mut self,
        except: Option<PeerID>,
        msg: S,
        limit: usize,
    ) {
        self.network.except_cast_limit(except, msg.into(), limit)
    }

    /// Send to every connected observer.
    pub(crate) fn broadcast_to_observers<S: Into<Message>>(&mut self, msg: S) {
        let msg = msg.into();
        for peer in self.network.peers() {
            if peer.is_observer() {
                self.network.send(peer, msg.clone());
            }
        }
    }

    pub(crate) fn remove_peer(&mut self, peer: PeerID) {
        self.network.remove_peer(peer)
    }

    pub(crate) fn peers(&self) -> Vec<PeerID> {
        self.network.peers()
    }
}
