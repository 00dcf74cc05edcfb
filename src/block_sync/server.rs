/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The serving side of the block sync protocol: advertising the local tip, and answering requests for
//! connected blocks.
//!
//! Every node runs it. A request is answered with the blocks the node has among those asked for, at most
//! [`MAX_BLOCKS_PER_REQUEST`](super::messages::MAX_BLOCKS_PER_REQUEST), in ascending height order. A
//! request the node can serve none of is ignored: the client's request timer re-sends it elsewhere.

use crate::chain::Provider;
use crate::networking::network::{Network, PeerID};
use crate::networking::sending::SenderHandle;

use super::messages::{BlockMessage, RequestMessage, StatusMessage};

/// The local tip, as advertised to peers.
pub(crate) fn local_status<P: Provider + ?Sized>(provider: &P) -> StatusMessage {
    let (height, last_hash) = provider.last_status();
    StatusMessage {
        version: provider.version(),
        height,
        last_hash,
    }
}

/// The blocks to answer `request` with.
pub(crate) fn blocks_for<P: Provider + ?Sized>(provider: &P, request: &RequestMessage) -> BlockMessage {
    let height = provider.height();
    let blocks = request
        .heights()
        .take_while(|requested| *requested <= height)
        .map_while(|requested| provider.block(requested).ok())
        .collect();
    BlockMessage { blocks }
}

pub(crate) fn serve_request<P: Provider + ?Sized, N: Network>(
    provider: &P,
    sender: &mut SenderHandle<N>,
    origin: PeerID,
    request: &RequestMessage,
) {
    let response = blocks_for(provider, request);
    if !response.blocks.is_empty() {
        sender.send(origin, response);
    }
}
