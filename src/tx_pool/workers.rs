/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Parallel admission of transactions into a [`TxPool`].
//!
//! Recovering the signers of a transaction is the expensive part of admitting it, so a pool of worker
//! threads does it in parallel. Workers take jobs from one shared queue. Insertion itself goes through
//! the pool's lock and is therefore serialized.

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::formulator::messages::TransactionMessage;
use crate::networking::PeerID;
use crate::types::basic::{timestamp_now, ChainID, CryptoHash, PublicHash, Slot};

use super::{TxPool, TxPoolError};

/// A transaction waiting for admission, and the peer it came from (`None` if it was submitted locally).
pub(crate) struct TxJob {
    pub(crate) origin: Option<PeerID>,
    pub(crate) message: TransactionMessage,
}

/// Recover the signers of `message` and push it into `pool`. Returns the transaction's hash.
pub(crate) fn admit(
    pool: &TxPool,
    chain_id: ChainID,
    current_slot: Slot,
    message: &TransactionMessage,
) -> Result<CryptoHash, AdmissionError> {
    let tx_hash = message.tx_hash(chain_id);
    if pool.is_exist(&tx_hash) {
        return Err(TxPoolError::ExistTransaction(tx_hash).into());
    }

    let signers = message
        .signatures
        .iter()
        .map(|signature| signature.recover(&tx_hash))
        .collect::<Result<Vec<PublicHash>, _>>()
        .map_err(|_| AdmissionError::InvalidTransactionSignature(tx_hash))?;

    pool.push(
        current_slot,
        message.tx_type,
        tx_hash,
        message.transaction.clone(),
        message.signatures.clone(),
        signers,
    )?;
    Ok(tx_hash)
}

/// Spawn `count` workers that admit the jobs of `jobs` into `pool`, and call `on_admitted` for each
/// transaction that made it in. Workers return once `close` is set or every job sender is gone.
pub(crate) fn start_tx_workers<F>(
    count: usize,
    pool: Arc<TxPool>,
    chain_id: ChainID,
    slot_length_ns: u64,
    jobs: Receiver<TxJob>,
    close: Arc<AtomicBool>,
    on_admitted: F,
) -> Vec<JoinHandle<()>>
where
    F: Fn(TxJob) + Clone + Send + 'static,
{
    let jobs = Arc::new(Mutex::new(jobs));
    (0..count.max(1))
        .map(|_| {
            let jobs = jobs.clone();
            let pool = pool.clone();
            let close = close.clone();
            let on_admitted = on_admitted.clone();
            thread::spawn(move || {
                while !close.load(Ordering::Acquire) {
                    let job = {
                        let jobs = jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                        jobs.recv_timeout(Duration::from_millis(50))
                    };
                    match job {
                        Ok(job) => {
                            let current_slot = Slot::of(timestamp_now(), slot_length_ns);
                            match admit(&pool, chain_id, current_slot, &job.message) {
                                Ok(_) => on_admitted(job),
                                Err(error) => log::trace!("transaction not admitted: {}", error),
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => (),
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    InvalidTransactionSignature(CryptoHash),
    TxPool(TxPoolError),
}

impl From<TxPoolError> for AdmissionError {
    fn from(error: TxPoolError) -> Self {
        AdmissionError::TxPool(error)
    }
}

impl Display for AdmissionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionError::InvalidTransactionSignature(tx_hash) => {
                write!(f, "transaction {} has an invalid signature", tx_hash)
            }
            AdmissionError::TxPool(error) => write!(f, "{}", error),
        }
    }
}
