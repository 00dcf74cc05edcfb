use std::{
    thread,
    time::{Duration, Instant},
};

use log::LevelFilter;
use pof_rs::{
    config::{ConsensusPolicy, FormulatorConfiguration, ObserverConfiguration},
    consensus::{initialize, ConsensusState},
    formulator::{Formulator, FormulatorSpec},
    networking::Network,
    observer::{Observer, ObserverSpec},
    rank_table::{Rank, RankTable},
    types::{
        basic::{timestamp_now, Address, ChainID, CryptoHash, PublicHash, Timestamp},
        block::Transaction,
        crypto_primitives::{public_hash, Keypair, RecoverableSignature, SigningKey},
    },
};
use rand_core::OsRng;

use super::{
    logging::{node_name, setup_logger, short_id},
    mem_chain::MemChain,
};

pub(crate) const CHAIN_ID: ChainID = ChainID::new(7);

pub(crate) const GENESIS_TIMESTAMP: Timestamp = 1_000_000_000;

pub(crate) const MAX_BLOCKS_PER_FORMULATOR: u32 = 10;

/// The hash space every genesis rank starts from.
pub(crate) const GENESIS_HASH_SPACE: CryptoHash = CryptoHash::new([0; 32]);

/// The generator key and on-chain address of a formulator.
pub(crate) struct FormulatorKey {
    pub(crate) signing_key: SigningKey,
    pub(crate) address: Address,
}

impl FormulatorKey {
    pub(crate) fn new(index: u8) -> FormulatorKey {
        FormulatorKey {
            signing_key: SigningKey::generate(&mut OsRng),
            address: Address::new([index; 20]),
        }
    }

    pub(crate) fn public_hash(&self) -> PublicHash {
        public_hash(&self.signing_key.verifying_key())
    }
}

pub(crate) fn observer_keys(count: usize) -> Vec<SigningKey> {
    let mut csprg = OsRng {};
    (0..count).map(|_| SigningKey::generate(&mut csprg)).collect()
}

pub(crate) fn observer_public_hash(key: &SigningKey) -> PublicHash {
    public_hash(&key.verifying_key())
}

/// A genesis state with every formulator at phase 0 and the same hash space.
pub(crate) fn genesis(observers: &[SigningKey], formulators: &[FormulatorKey]) -> ConsensusState {
    let ranks = formulators
        .iter()
        .map(|formulator| Rank::new(formulator.address, formulator.public_hash(), 0, GENESIS_HASH_SPACE));
    ConsensusState::new(
        MAX_BLOCKS_PER_FORMULATOR,
        observers.iter().map(observer_public_hash),
        RankTable::from_candidates(0, ranks).unwrap(),
    )
}

pub(crate) fn new_chain(genesis: &ConsensusState) -> MemChain {
    let chain = MemChain::new(CHAIN_ID, GENESIS_TIMESTAMP);
    initialize(&chain, genesis).unwrap();
    chain
}

pub(crate) fn test_policy() -> ConsensusPolicy {
    ConsensusPolicy {
        block_interval: Duration::from_millis(100),
        ..ConsensusPolicy::default()
    }
}

pub(crate) fn observer_configuration(me: SigningKey) -> ObserverConfiguration {
    ObserverConfiguration::builder()
        .me(me)
        .chain_id(CHAIN_ID)
        .policy(test_policy())
        .tick_interval(Duration::from_millis(50))
        .round_timeout_ticks(40)
        .block_gen_request_interval(Duration::from_millis(200))
        .sync_request_timeout(Duration::from_secs(1))
        .build()
}

pub(crate) fn formulator_configuration(key: &FormulatorKey) -> FormulatorConfiguration {
    FormulatorConfiguration::builder()
        .me(key.signing_key.clone())
        .address(key.address)
        .chain_id(CHAIN_ID)
        .policy(test_policy())
        .tx_loop_duration(Duration::from_millis(20))
        .block_gen_pace(Duration::from_millis(50))
        .tx_workers(2)
        .sync_request_timeout(Duration::from_secs(1))
        .build()
}

pub(crate) fn start_observer<N: Network + 'static>(
    chain: MemChain,
    network: N,
    me: SigningKey,
) -> Observer<MemChain> {
    setup_logger(LevelFilter::Info);
    let name = node_name("observer", &observer_public_hash(&me).bytes());
    ObserverSpec::builder()
        .chain(chain)
        .network(network)
        .configuration(observer_configuration(me))
        .on_commit_block({
            let name = name.clone();
            move |event| {
                log::info!(
                    "{} committed {} at {}",
                    name,
                    short_id(&event.block.bytes()),
                    event.height
                )
            }
        })
        .on_consensus_halted(move |event| log::warn!("{} halted: {}", name, event.reason))
        .build()
        .start()
        .unwrap()
}

pub(crate) fn start_formulator<N: Network + 'static>(
    chain: MemChain,
    network: N,
    key: &FormulatorKey,
) -> Formulator<MemChain> {
    setup_logger(LevelFilter::Info);
    let name = node_name("formulator", &key.address.bytes());
    FormulatorSpec::builder()
        .chain(chain)
        .network(network)
        .configuration(formulator_configuration(key))
        .on_generate_block(move |event| {
            log::info!(
                "{} generated {} at {}",
                name,
                short_id(&event.block.bytes()),
                event.height
            )
        })
        .build()
        .start()
        .unwrap()
}

/// A transaction with a unique payload, signed by `signer` for this chain.
pub(crate) fn signed_transaction(
    nonce: u64,
    signer: &SigningKey,
) -> (Transaction, Vec<RecoverableSignature>) {
    let transaction = Transaction::new(timestamp_now(), nonce.to_le_bytes().to_vec());
    let signature = Keypair::new(signer.clone()).sign(&transaction.hash(CHAIN_ID, 0));
    (transaction, vec![signature])
}

/// Poll `condition` until it holds or `timeout` passes. Returns whether it held.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    condition()
}
