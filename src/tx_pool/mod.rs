/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Hash-indexed transaction pool with time slot admission.
//!
//! Transactions are bucketed by the [`Slot`] their timestamp falls into. Within a slot, transactions are
//! popped in the order they were admitted. The pool only admits transactions whose slot is within
//! `[current_slot - 1, current_slot + 10]`, and [`clean`](TxPool::clean) evicts slots that fell out of
//! that window.
//!
//! ## Proposer locking
//!
//! A formulator fills a block by popping transactions one at a time and executing them. To stop writers
//! from interleaving with that loop, the formulator takes the pool's lock once with
//! [`lock`](TxPool::lock) and pops through the returned [`LockedPool`] until the block is full.

pub(crate) mod workers;

pub use workers::AdmissionError;

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};
use std::sync::{Mutex, MutexGuard};

use crate::types::basic::{CryptoHash, PublicHash, Slot};
use crate::types::block::{Transaction, TxType};
use crate::types::crypto_primitives::RecoverableSignature;

/// Number of slots past the current slot that the pool accepts.
pub const MAX_FUTURE_SLOTS: u32 = 10;

/// A transaction waiting to be included in a block, together with the signers recovered from its
/// signatures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolItem {
    pub tx_type: TxType,
    pub tx_hash: CryptoHash,
    pub transaction: Transaction,
    pub signatures: Vec<RecoverableSignature>,
    pub signers: Vec<PublicHash>,
}

pub struct TxPool {
    state: Mutex<PoolState>,
    slot_length_ns: u64,
    capacity: usize,
}

#[derive(Default)]
struct PoolState {
    slot_map: BTreeMap<Slot, BTreeMap<u64, PoolItem>>,
    tx_hash_map: HashMap<CryptoHash, (Slot, u64)>,
    next_seq: u64,
}

impl TxPool {
    pub fn new(slot_length_ns: u64, capacity: usize) -> TxPool {
        TxPool {
            state: Mutex::new(PoolState::default()),
            slot_length_ns,
            capacity,
        }
    }

    pub fn slot_of(&self, transaction: &Transaction) -> Slot {
        Slot::of(transaction.timestamp, self.slot_length_ns)
    }

    /// Admit a transaction whose signatures were already recovered into `signers`.
    pub fn push(
        &self,
        current_slot: Slot,
        tx_type: TxType,
        tx_hash: CryptoHash,
        transaction: Transaction,
        signatures: Vec<RecoverableSignature>,
        signers: Vec<PublicHash>,
    ) -> Result<(), TxPoolError> {
        let slot = self.slot_of(&transaction);
        if slot < current_slot.prev()
            || slot.int() > current_slot.int().saturating_add(MAX_FUTURE_SLOTS)
        {
            return Err(TxPoolError::InvalidTransactionTimeSlot {
                slot,
                current: current_slot,
            });
        }

        let mut state = self.lock_state();
        if state.tx_hash_map.contains_key(&tx_hash) {
            return Err(TxPoolError::ExistTransaction(tx_hash));
        }
        if state.tx_hash_map.len() >= self.capacity {
            return Err(TxPoolError::TransactionPoolOverflowed);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.tx_hash_map.insert(tx_hash, (slot, seq));
        state.slot_map.entry(slot).or_default().insert(
            seq,
            PoolItem {
                tx_type,
                tx_hash,
                transaction,
                signatures,
                signers,
            },
        );
        Ok(())
    }

    pub fn is_exist(&self, tx_hash: &CryptoHash) -> bool {
        self.lock_state().tx_hash_map.contains_key(tx_hash)
    }

    pub fn get(&self, tx_hash: &CryptoHash) -> Option<PoolItem> {
        let state = self.lock_state();
        let (slot, seq) = state.tx_hash_map.get(tx_hash)?;
        state.slot_map.get(slot)?.get(seq).cloned()
    }

    pub fn remove(&self, tx_hash: &CryptoHash) -> Option<PoolItem> {
        self.lock_state().remove(tx_hash)
    }

    pub fn len(&self) -> usize {
        self.lock_state().tx_hash_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every slot before `current_slot - 1` and return the evicted transactions.
    pub fn clean(&self, current_slot: Slot) -> Vec<Transaction> {
        let mut state = self.lock_state();
        let kept = state.slot_map.split_off(&current_slot.prev());
        let evicted = std::mem::replace(&mut state.slot_map, kept);

        let mut transactions = Vec::new();
        for item in evicted.into_values().flat_map(BTreeMap::into_values) {
            state.tx_hash_map.remove(&item.tx_hash);
            transactions.push(item.transaction);
        }
        transactions
    }

    /// Pop the oldest admission of slot `current_slot - 1`, or else of `current_slot`.
    pub fn pop(&self, current_slot: Slot) -> Option<PoolItem> {
        self.lock_state().pop(current_slot)
    }

    /// Hold the pool's lock until the returned guard is dropped.
    pub fn lock(&self) -> LockedPool<'_> {
        LockedPool {
            state: self.lock_state(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive access to a [`TxPool`] for the duration of a proposer's transaction loop.
pub struct LockedPool<'a> {
    state: MutexGuard<'a, PoolState>,
}

impl LockedPool<'_> {
    /// Same as [`TxPool::pop`], without taking the lock again.
    pub fn unsafe_pop(&mut self, current_slot: Slot) -> Option<PoolItem> {
        self.state.pop(current_slot)
    }

    pub fn len(&self) -> usize {
        self.state.tx_hash_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.tx_hash_map.is_empty()
    }
}

impl PoolState {
    fn pop(&mut self, current_slot: Slot) -> Option<PoolItem> {
        let previous = current_slot.prev();
        if previous != current_slot {
            match self.pop_from(previous) {
                Some(item) => return Some(item),
                None => {
                    self.slot_map.remove(&previous);
                }
            }
        }
        self.pop_from(current_slot)
    }

    fn pop_from(&mut self, slot: Slot) -> Option<PoolItem> {
        let queue = self.slot_map.get_mut(&slot)?;
        let (_, item) = queue.pop_first()?;
        if queue.is_empty() {
            self.slot_map.remove(&slot);
        }
        self.tx_hash_map.remove(&item.tx_hash);
        Some(item)
    }

    fn remove(&mut self, tx_hash: &CryptoHash) -> Option<PoolItem> {
        let (slot, seq) = self.tx_hash_map.remove(tx_hash)?;
        let queue = self.slot_map.get_mut(&slot)?;
        let item = queue.remove(&seq);
        if queue.is_empty() {
            self.slot_map.remove(&slot);
        }
        item
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxPoolError {
    ExistTransaction(CryptoHash),
    InvalidTransactionTimeSlot { slot: Slot, current: Slot },
    TransactionPoolOverflowed,
}

impl Display for TxPoolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TxPoolError::ExistTransaction(tx_hash) => {
                write!(f, "transaction {} is already in the pool", tx_hash)
            }
            TxPoolError::InvalidTransactionTimeSlot { slot, current } => write!(
                f,
                "transaction slot {} is outside the admission window of slot {}",
                slot, current
            ),
            TxPoolError::TransactionPoolOverflowed => write!(f, "transaction pool is full"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::ChainID;

    const SLOT_LENGTH_NS: u64 = 1_000_000_000;

    fn transaction(slot: u32, nonce: u8) -> (CryptoHash, Transaction) {
        let transaction = Transaction::new(slot as u64 * SLOT_LENGTH_NS + nonce as u64, vec![nonce]);
        (transaction.hash(ChainID::new(1), 0), transaction)
    }

    fn push(pool: &TxPool, current: u32, slot: u32, nonce: u8) -> Result<CryptoHash, TxPoolError> {
        let (tx_hash, transaction) = transaction(slot, nonce);
        pool.push(
            Slot::new(current),
            0,
            tx_hash,
            transaction,
            Vec::new(),
            Vec::new(),
        )
        .map(|_| tx_hash)
    }

    #[test]
    fn admission_window_and_clean() {
        let pool = TxPool::new(SLOT_LENGTH_NS, 1024);
        let s = 100;

        assert!(matches!(
            push(&pool, s, s - 2, 1),
            Err(TxPoolError::InvalidTransactionTimeSlot { .. })
        ));
        let previous = push(&pool, s, s - 1, 2).unwrap();
        let current = push(&pool, s, s, 3).unwrap();
        let future = push(&pool, s, s + 10, 4).unwrap();
        assert!(matches!(
            push(&pool, s, s + 11, 5),
            Err(TxPoolError::InvalidTransactionTimeSlot { .. })
        ));
        assert_eq!(pool.len(), 3);

        let evicted = pool.clean(Slot::new(s + 1));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].hash(ChainID::new(1), 0), previous);
        assert!(!pool.is_exist(&previous));
        assert!(pool.is_exist(&current));
        assert!(pool.is_exist(&future));
    }

    #[test]
    fn push_rejects_duplicates_and_overflow() {
        let pool = TxPool::new(SLOT_LENGTH_NS, 2);
        let tx_hash = push(&pool, 10, 10, 1).unwrap();
        assert_eq!(
            push(&pool, 10, 10, 1),
            Err(TxPoolError::ExistTransaction(tx_hash))
        );
        push(&pool, 10, 10, 2).unwrap();
        assert_eq!(
            push(&pool, 10, 10, 3),
            Err(TxPoolError::TransactionPoolOverflowed)
        );
    }

    #[test]
    fn pop_drains_previous_slot_first_in_admission_order() {
        let pool = TxPool::new(SLOT_LENGTH_NS, 1024);
        let a = push(&pool, 10, 10, 1).unwrap();
        let b = push(&pool, 10, 9, 2).unwrap();
        let c = push(&pool, 10, 9, 3).unwrap();
        let d = push(&pool, 10, 11, 4).unwrap();

        let mut locked = pool.lock();
        assert_eq!(locked.unsafe_pop(Slot::new(10)).unwrap().tx_hash, b);
        assert_eq!(locked.unsafe_pop(Slot::new(10)).unwrap().tx_hash, c);
        assert_eq!(locked.unsafe_pop(Slot::new(10)).unwrap().tx_hash, a);
        assert_eq!(locked.unsafe_pop(Slot::new(10)), None);
        assert_eq!(locked.len(), 1);
        drop(locked);

        assert_eq!(pool.pop(Slot::new(11)).unwrap().tx_hash, d);
        assert!(pool.is_empty());
    }

    #[test]
    fn every_item_is_reachable_from_both_indices() {
        let pool = TxPool::new(SLOT_LENGTH_NS, 1024);
        let hashes: Vec<CryptoHash> = (0..6)
            .map(|nonce| push(&pool, 50, 49 + nonce as u32 % 3, nonce).unwrap())
            .collect();

        assert_eq!(pool.remove(&hashes[0]).unwrap().tx_hash, hashes[0]);
        assert_eq!(pool.remove(&hashes[0]), None);
        for tx_hash in &hashes[1..] {
            let item = pool.get(tx_hash).unwrap();
            assert_eq!(pool.slot_of(&item.transaction).int(), 49 + item.transaction.payload[0] as u32 % 3);
            assert!(pool.is_exist(tx_hash));
        }

        while pool.pop(Slot::new(52)).is_some() {}
        assert!(hashes[1..].iter().all(|tx_hash| pool.is_exist(tx_hash) == pool.get(tx_hash).is_some()));
    }
}
