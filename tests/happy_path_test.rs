use std::time::Duration;

use pof_rs::{
    consensus::{quorum, ConsensusState},
    types::{basic::BlockHeight, crypto_primitives::SigningKey},
};

mod common;

use crate::common::{
    cluster::*,
    network::{mock_network, Role},
};

#[test]
fn happy_path_test() {
    // 1. Initialize test components.

    // 1.1. Create keys for 5 observers and 3 formulators.
    let observer_keys = observer_keys(5);
    let formulator_keys: Vec<FormulatorKey> = (1..=3).map(FormulatorKey::new).collect();
    let genesis = genesis(&observer_keys, &formulator_keys);
    let first_formulator = genesis.rank_table().top_rank(0).unwrap();

    // 1.2. Create a mock network connecting all 8 nodes.
    let mut networks = mock_network(
        observer_keys
            .iter()
            .map(|key| (observer_public_hash(key), Role::Observer))
            .chain(
                formulator_keys
                    .iter()
                    .map(|key| (key.public_hash(), Role::Formulator(key.address))),
            ),
    );
    let formulator_networks = networks.split_off(observer_keys.len());

    // 1.3. Start every node on its own copy of the genesis chain.
    let observer_chains: Vec<_> = observer_keys.iter().map(|_| new_chain(&genesis)).collect();
    let observers: Vec<_> = observer_keys
        .iter()
        .zip(networks)
        .zip(&observer_chains)
        .map(|((key, network), chain)| start_observer(chain.clone(), network, SigningKey::clone(key)))
        .collect();
    let formulators: Vec<_> = formulator_keys
        .iter()
        .zip(formulator_networks)
        .map(|(key, network)| start_formulator(new_chain(&genesis), network, key))
        .collect();

    // 2. Submit transactions to one formulator. They are gossiped to the others.
    let user = FormulatorKey::new(99).signing_key;
    for nonce in 0..5 {
        let (transaction, signatures) = signed_transaction(nonce, &user);
        formulators[1].push_transaction(0, transaction, signatures).unwrap();
    }

    // 3. Wait until every observer has committed the first formulator's turn and the first block of the
    // next one.
    log::debug!("Polling every observer until the height is 11.");
    assert!(wait_until(Duration::from_secs(60), || observers
        .iter()
        .all(|observer| observer.height() >= BlockHeight::new(MAX_BLOCKS_PER_FORMULATOR + 1))));
    assert!(wait_until(Duration::from_secs(10), || observer_chains
        .iter()
        .all(|chain| chain.executed() == 5)));
    assert!(observers.iter().all(|observer| !observer.is_halted()));
    drop(formulators);
    drop(observers);

    // 4. The first block is by the top formulator and carries exactly a quorum of observer signatures.
    let blocks = observer_chains[0].blocks();
    let first_block = &blocks[1];
    assert_eq!(first_block.header.generator, first_formulator.address);
    assert_eq!(first_block.header.timeout_count(), Some(0));
    assert_eq!(first_block.signatures.len(), 1 + quorum(observer_keys.len()));

    let after_first_block = {
        let mut state = genesis.clone();
        state.apply_block(&first_block.header, None).unwrap();
        state
    };
    assert_eq!(after_first_block.blocks_by_same_formulator(), 1);
    assert_eq!(after_first_block.rank_table().top_rank(0).unwrap(), first_formulator);

    // 5. The whole turn of the first formulator, then a move down the rank table with the hash of its
    // last block as the new hash space.
    for block in &blocks[1..=MAX_BLOCKS_PER_FORMULATOR as usize] {
        assert_eq!(block.header.generator, first_formulator.address);
    }
    let mut replayed = genesis.clone();
    for block in &blocks[1..=MAX_BLOCKS_PER_FORMULATOR as usize] {
        replayed.apply_block(&block.header, None).unwrap();
    }
    let moved = replayed.rank_table().rank(&first_formulator.address).unwrap();
    assert_eq!(moved.phase(), 1);
    assert_eq!(
        moved.hash_space(),
        blocks[MAX_BLOCKS_PER_FORMULATOR as usize].hash()
    );
    assert_eq!(replayed.blocks_by_same_formulator(), 0);
    assert_ne!(
        blocks[MAX_BLOCKS_PER_FORMULATOR as usize + 1].header.generator,
        first_formulator.address
    );

    // 6. Every observer holds the same chain, and a persisted state that matches replaying it.
    for chain in &observer_chains {
        let chain_blocks = chain.blocks();
        let common_height = chain_blocks.len().min(blocks.len());
        assert_eq!(chain_blocks[..common_height], blocks[..common_height]);

        let mut replayed = genesis.clone();
        for block in &chain_blocks[1..] {
            replayed.apply_block(&block.header, None).unwrap();
        }
        let persisted = ConsensusState::load(chain).unwrap().unwrap();
        assert_eq!(persisted.rank_table().candidates(), replayed.rank_table().candidates());
        assert_eq!(
            persisted.blocks_by_same_formulator(),
            replayed.blocks_by_same_formulator()
        );
    }
}
