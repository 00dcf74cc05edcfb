/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions and types for receiving messages from the P2P network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::messages::Message;
use super::network::{Network, PeerEvent, PeerID};

/// What a node's block sync thread consumes: session changes and the status/request protocol.
pub(crate) enum SyncEvent {
    Connected(PeerID),
    Disconnected(PeerID),
    Message(PeerID, Message),
}

/// Spawn the poller thread, which polls the [`Network`] for events and distributes them into receiver
/// handles.
///
/// The receivers are:
/// 1. Consensus messages (votes, block proposals, signatures and transactions), processed by the node's
///    main loop, and
/// 2. Sync events (session changes, `Status`, `Request` and `Block` messages), processed by the node's
///    block sync thread.
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    close: Arc<AtomicBool>,
) -> (
    JoinHandle<()>,
    Receiver<(PeerID, Message)>,
    Receiver<SyncEvent>,
) {
    let (to_consensus, consensus_receiver) = mpsc::channel();
    let (to_sync, sync_receiver) = mpsc::channel();

    let poller_thread = thread::spawn(move || {
        while !close.load(Ordering::Acquire) {
            match network.recv() {
                Some(PeerEvent::Connected(peer)) => {
                    let _ = to_sync.send(SyncEvent::Connected(peer));
                }
                Some(PeerEvent::Disconnected(peer)) => {
                    let _ = to_sync.send(SyncEvent::Disconnected(peer));
                }
                Some(PeerEvent::Message(origin, msg)) => match msg {
                    Message::Status(_) | Message::Request(_) | Message::Block(_) => {
                        let _ = to_sync.send(SyncEvent::Message(origin, msg));
                    }
                    _ => {
                        let _ = to_consensus.send((origin, msg));
                    }
                },
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
    });
    (poller_thread, consensus_receiver, sync_receiver)
}
