use std::{collections::HashMap, time::Duration};

use pof_rs::{
    formulator::messages::TransactionMessage,
    networking::{Message, Network, PeerEvent, PeerID},
};

mod common;

use crate::common::{
    cluster::*,
    network::{mock_network, NetworkStub, Role},
};

const NODE_PEERS: usize = 20;

const GOSSIP_LIMIT: usize = 7;

/// Drain the transactions that reached `node` so far.
fn received_transactions(node: &mut NetworkStub) -> usize {
    let mut count = 0;
    while let Some(event) = node.recv() {
        if let PeerEvent::Message(_, Message::Transaction(_)) = event {
            count += 1;
        }
    }
    count
}

#[test]
fn gossip_test() {
    // 1. Initialize test components.

    // 1.1. One formulator connected to 20 plain nodes.
    let observer_keys = observer_keys(3);
    let formulator_key = FormulatorKey::new(1);
    let genesis = genesis(&observer_keys, std::slice::from_ref(&formulator_key));

    let node_keys: Vec<FormulatorKey> = (0..NODE_PEERS as u8).map(|i| FormulatorKey::new(100 + i)).collect();
    let mut networks = mock_network(
        std::iter::once((formulator_key.public_hash(), Role::Formulator(formulator_key.address))).chain(
            node_keys.iter().map(|key| (key.public_hash(), Role::Node)),
        ),
    );
    let mut nodes = networks.split_off(1);
    let network = networks.remove(0);
    let formulator_peer = network.seen_by(Role::Node);
    assert_eq!(network.peers().len(), NODE_PEERS);

    let formulator = start_formulator(new_chain(&genesis), network, &formulator_key);
    let user = FormulatorKey::new(99).signing_key;

    // 2. A transaction pushed by node 0 reaches exactly `GOSSIP_LIMIT` other nodes.
    let (transaction, signatures) = signed_transaction(0, &user);
    nodes[0].send(
        formulator_peer,
        Message::Transaction(TransactionMessage {
            tx_type: 0,
            transaction,
            signatures,
        }),
    );
    assert!(wait_until(Duration::from_secs(5), || formulator.tx_pool_len() == 1));

    let mut counts: HashMap<PeerID, usize> = HashMap::new();
    assert!(wait_until(Duration::from_secs(5), || {
        for (node, key) in nodes.iter_mut().zip(&node_keys) {
            *counts.entry(PeerID::Node(key.public_hash())).or_default() += received_transactions(node);
        }
        counts.values().sum::<usize>() >= GOSSIP_LIMIT
    }));
    assert_eq!(counts.values().sum::<usize>(), GOSSIP_LIMIT);
    assert_eq!(counts[&PeerID::Node(node_keys[0].public_hash())], 0);
    assert!(counts.values().all(|count| *count <= 1));

    // 3. Over one cast per eligible peer, every eligible peer receives exactly `GOSSIP_LIMIT` transactions.
    let eligible = NODE_PEERS - 1;
    for nonce in 1..eligible as u64 {
        let (transaction, signatures) = signed_transaction(nonce, &user);
        nodes[0].send(
            formulator_peer,
            Message::Transaction(TransactionMessage {
                tx_type: 0,
                transaction,
                signatures,
            }),
        );
    }
    assert!(wait_until(Duration::from_secs(10), || {
        for (node, key) in nodes.iter_mut().zip(&node_keys) {
            *counts.entry(PeerID::Node(key.public_hash())).or_default() += received_transactions(node);
        }
        counts.values().sum::<usize>() >= GOSSIP_LIMIT * eligible
    }));
    assert_eq!(formulator.tx_pool_len(), eligible);
    assert_eq!(counts[&PeerID::Node(node_keys[0].public_hash())], 0);
    for (peer, count) in &counts {
        if *peer != PeerID::Node(node_keys[0].public_hash()) {
            assert_eq!(*count, GOSSIP_LIMIT, "{} received {} transactions", peer, count);
        }
    }
}
