/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Transactions gossiped over the formulator peer mesh.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{ChainID, CryptoHash};
use crate::types::block::{Transaction, TxType};
use crate::types::crypto_primitives::RecoverableSignature;

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TransactionMessage {
    pub tx_type: TxType,
    pub transaction: Transaction,
    pub signatures: Vec<RecoverableSignature>,
}

impl TransactionMessage {
    pub fn tx_hash(&self, chain_id: ChainID) -> CryptoHash {
        self.transaction.hash(chain_id, self.tx_type)
    }
}
