use pof_rs::{
    formulator::FormulatorError,
    tx_pool::{AdmissionError, TxPoolError},
    types::{
        basic::{timestamp_now, ChainID},
        block::Transaction,
        crypto_primitives::Keypair,
    },
};

mod common;

use crate::common::{
    cluster::*,
    network::{mock_network, Role},
};

#[test]
fn transaction_admission_test() {
    // 1. Start a lone formulator.
    let observer_keys = observer_keys(3);
    let formulator_key = FormulatorKey::new(1);
    let genesis = genesis(&observer_keys, std::slice::from_ref(&formulator_key));
    let network = mock_network(std::iter::once((
        formulator_key.public_hash(),
        Role::Formulator(formulator_key.address),
    )))
    .remove(0);
    let formulator = start_formulator(new_chain(&genesis), network, &formulator_key);
    let user = FormulatorKey::new(99).signing_key;

    // 2. A signed transaction is admitted once.
    let (transaction, signatures) = signed_transaction(1, &user);
    let tx_hash = formulator
        .push_transaction(0, transaction.clone(), signatures.clone())
        .unwrap();
    assert_eq!(formulator.tx_pool_len(), 1);
    assert!(matches!(
        formulator.push_transaction(0, transaction, signatures),
        Err(FormulatorError::Admission(AdmissionError::TxPool(TxPoolError::ExistTransaction(hash)))) if hash == tx_hash
    ));

    // 3. A signature over the same transaction on another chain is rejected.
    let transaction = Transaction::new(timestamp_now(), vec![2]);
    let signature = Keypair::new(user.clone()).sign(&transaction.hash(ChainID::new(CHAIN_ID.int() + 1), 0));
    assert!(matches!(
        formulator.push_transaction(0, transaction, vec![signature]),
        Err(FormulatorError::Admission(AdmissionError::InvalidTransactionSignature(_)))
    ));

    // 4. A transaction from too far in the past is rejected.
    let transaction = Transaction::new(GENESIS_TIMESTAMP, vec![3]);
    let signature = Keypair::new(user).sign(&transaction.hash(CHAIN_ID, 0));
    assert!(matches!(
        formulator.push_transaction(0, transaction, vec![signature]),
        Err(FormulatorError::Admission(AdmissionError::TxPool(
            TxPoolError::InvalidTransactionTimeSlot { .. }
        )))
    ));
    assert_eq!(formulator.tx_pool_len(), 1);
}
