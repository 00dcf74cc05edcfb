/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Subprotocol that catches the local chain up with its peers in case the node missed blocks.
//!
//! Both observers and formulators run it on a dedicated thread, next to their consensus threads:
//! 1. On connecting to a peer, the node sends it a [`StatusMessage`](messages::StatusMessage) with its
//!    tip. Nodes also broadcast their status after every commit.
//! 2. A node that learns of a higher tip requests the missing blocks ([client]).
//! 3. Every node answers requests for blocks it has ([server]).
//!
//! The sync thread and consensus threads share the [`Consensus`] handle, so whichever thread connects a
//! block first wins, and the others see it as already connected.

pub mod messages;

pub(crate) mod client;

pub(crate) mod server;

pub use client::BlockSyncError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::chain::Chain;
use crate::consensus::Consensus;
use crate::events::Event;
use crate::networking::messages::Message;
use crate::networking::network::Network;
use crate::networking::receiving::SyncEvent;
use crate::networking::sending::SenderHandle;
use crate::request_timer::{start_ticker, RequestTimer};

use client::BlockSyncClient;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TIMER_TICK: Duration = Duration::from_millis(100);

pub(crate) fn start_block_sync<C: Chain, N: Network + 'static>(
    consensus: Consensus<C>,
    network: N,
    sync_events: Receiver<SyncEvent>,
    request_timeout: Duration,
    close: Arc<AtomicBool>,
    event_publisher: Option<Sender<Event>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut sender = SenderHandle::new(network);
        let request_timer = Arc::new(RequestTimer::new());
        let (expired_sender, expired) = mpsc::channel();
        let ticker_close = Arc::new(AtomicBool::new(false));
        let ticker = start_ticker(
            request_timer.clone(),
            TIMER_TICK,
            ticker_close.clone(),
            move |height, peer| {
                let _ = expired_sender.send((height, peer));
            },
        );

        let mut client = BlockSyncClient::new(
            consensus.clone(),
            sender.clone(),
            request_timer,
            request_timeout,
            event_publisher,
        );

        while !close.load(Ordering::Acquire) {
            while let Ok((height, peer)) = expired.try_recv() {
                client.on_request_expired(height, peer);
            }

            match sync_events.recv_timeout(POLL_INTERVAL) {
                Ok(SyncEvent::Connected(peer)) => {
                    sender.send(peer, server::local_status(consensus.chain()));
                }
                Ok(SyncEvent::Disconnected(peer)) => client.on_disconnected(peer),
                Ok(SyncEvent::Message(origin, Message::Status(status))) => {
                    client.on_status(origin, status)
                }
                Ok(SyncEvent::Message(origin, Message::Request(request))) => {
                    server::serve_request(consensus.chain(), &mut sender, origin, &request)
                }
                Ok(SyncEvent::Message(origin, Message::Block(response))) => {
                    client.on_blocks(origin, response.blocks)
                }
                Ok(SyncEvent::Message(..)) => (),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        ticker_close.store(true, Ordering::Release);
        let _ = ticker.join();
    })
}
