use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use pof_rs::{
    chain::{BlockCreator, BlockTemplate, ChainError, Committer, Provider, SignerHintMap},
    tx_pool::PoolItem,
    types::{
        basic::{BlockHeight, ChainID, CryptoHash, Timestamp},
        block::{Block, Header, Transaction, TxType},
        crypto_primitives::{hash, RecoverableSignature},
    },
};

pub(crate) const VERSION: u16 = 1;

/// An in-memory chain whose "state" is the set of transactions it has executed. A transaction with an
/// empty payload is always rejected by the executor.
#[derive(Clone)]
pub(crate) struct MemChain {
    chain_id: ChainID,
    inner: Arc<Mutex<MemChainInner>>,
}

struct MemChainInner {
    blocks: Vec<Block>,
    executed: u64,
    included: HashSet<CryptoHash>,
    process_data: HashMap<Vec<u8>, Vec<u8>>,
}

/// Post-state of a block that is not connected yet.
#[derive(Clone, Debug)]
pub(crate) struct MemContext {
    height: BlockHeight,
    executed: u64,
    included: HashSet<CryptoHash>,
}

impl MemChain {
    /// A chain holding only a genesis block. Chains created with the same arguments share a genesis hash.
    pub(crate) fn new(chain_id: ChainID, genesis_timestamp: Timestamp) -> MemChain {
        let genesis = Block {
            header: Header {
                chain_id,
                version: VERSION,
                height: BlockHeight::new(0),
                prev_hash: CryptoHash::new([0; 32]),
                body_hash: Block::body_hash(&[], &[], &[]),
                context_hash: context_hash(BlockHeight::new(0), 0),
                timestamp: genesis_timestamp,
                generator: Default::default(),
                consensus_data: Header::encode_consensus_data(0),
            },
            transaction_types: Vec::new(),
            transactions: Vec::new(),
            transaction_signatures: Vec::new(),
            signatures: Vec::new(),
        };
        MemChain {
            chain_id,
            inner: Arc::new(Mutex::new(MemChainInner {
                blocks: vec![genesis],
                executed: 0,
                included: HashSet::new(),
                process_data: HashMap::new(),
            })),
        }
    }

    fn inner(&self) -> MutexGuard<'_, MemChainInner> {
        self.inner.lock().unwrap()
    }

    pub(crate) fn blocks(&self) -> Vec<Block> {
        self.inner().blocks.clone()
    }

    pub(crate) fn executed(&self) -> u64 {
        self.inner().executed
    }

    fn execute(
        &self,
        context: &mut MemContext,
        tx_type: TxType,
        transaction: &Transaction,
    ) -> Result<(), ChainError> {
        let tx_hash = transaction.hash(self.chain_id, tx_type);
        if transaction.payload.is_empty() {
            return Err(ChainError::InvalidTransaction {
                reason: "empty payload".to_string(),
            });
        }
        if context.included.contains(&tx_hash) || self.inner().included.contains(&tx_hash) {
            return Err(ChainError::InvalidTransaction {
                reason: format!("{} already executed", tx_hash),
            });
        }
        context.included.insert(tx_hash);
        context.executed += 1;
        Ok(())
    }

    fn apply(&self, block: &Block, context: MemContext) {
        let mut inner = self.inner();
        inner.blocks.push(block.clone());
        inner.executed = context.executed;
        inner.included.extend(context.included);
    }
}

fn context_hash(height: BlockHeight, executed: u64) -> CryptoHash {
    hash(&(height, executed))
}

impl Provider for MemChain {
    fn chain_id(&self) -> ChainID {
        self.chain_id
    }

    fn version(&self) -> u16 {
        VERSION
    }

    fn height(&self) -> BlockHeight {
        BlockHeight::new(self.inner().blocks.len() as u32 - 1)
    }

    fn last_hash(&self) -> CryptoHash {
        self.inner().blocks.last().unwrap().hash()
    }

    fn last_timestamp(&self) -> Timestamp {
        self.inner().blocks.last().unwrap().header.timestamp
    }

    fn last_status(&self) -> (BlockHeight, CryptoHash) {
        let inner = self.inner();
        let last = inner.blocks.last().unwrap();
        (last.height(), last.hash())
    }

    fn hash(&self, height: BlockHeight) -> Result<CryptoHash, ChainError> {
        self.block(height).map(|block| block.hash())
    }

    fn block(&self, height: BlockHeight) -> Result<Block, ChainError> {
        self.inner()
            .blocks
            .get(height.int() as usize)
            .cloned()
            .ok_or(ChainError::BlockNotFound { height })
    }

    fn process_data(&self, tag: &[u8]) -> Option<Vec<u8>> {
        self.inner().process_data.get(tag).cloned()
    }
}

impl Committer for MemChain {
    type Context = MemContext;
    type Creator = MemBlockCreator;

    fn new_context(&self) -> MemContext {
        let inner = self.inner();
        MemContext {
            height: BlockHeight::new(inner.blocks.len() as u32 - 1),
            executed: inner.executed,
            included: HashSet::new(),
        }
    }

    fn context_hash(&self, context: &MemContext) -> CryptoHash {
        context_hash(context.height, context.executed)
    }

    fn connect_block(
        &self,
        block: &Block,
        signer_hint: Option<&SignerHintMap>,
    ) -> Result<(), ChainError> {
        let mut context = self.new_context();
        self.execute_block_on_context(block, &mut context, signer_hint)?;
        let computed = self.context_hash(&context);
        if computed != block.header.context_hash {
            return Err(ChainError::InvalidContextHash {
                expected: block.header.context_hash,
                computed,
            });
        }
        self.connect_block_with_context(block, context)
    }

    fn connect_block_with_context(&self, block: &Block, context: MemContext) -> Result<(), ChainError> {
        self.validate_header(&block.header)?;
        if context.height != block.height() {
            return Err(ChainError::InvalidHeader {
                reason: "context was computed for another height".to_string(),
            });
        }
        self.apply(block, context);
        Ok(())
    }

    fn execute_block_on_context(
        &self,
        block: &Block,
        context: &mut MemContext,
        _: Option<&SignerHintMap>,
    ) -> Result<(), ChainError> {
        for (tx_type, transaction) in block.transaction_types.iter().zip(&block.transactions) {
            self.execute(context, *tx_type, transaction)?;
        }
        context.height = block.height();
        Ok(())
    }

    fn validate_header(&self, header: &Header) -> Result<(), ChainError> {
        let (height, last_hash) = self.last_status();
        let reason = if header.chain_id != self.chain_id {
            "chain id mismatch"
        } else if header.version != VERSION {
            "version mismatch"
        } else if header.height != height.next() {
            "not the next height"
        } else if header.prev_hash != last_hash {
            "does not extend the tip"
        } else {
            return Ok(());
        };
        Err(ChainError::InvalidHeader {
            reason: reason.to_string(),
        })
    }

    fn new_block_creator(
        &self,
        parent: Option<&MemContext>,
        template: BlockTemplate,
    ) -> Result<MemBlockCreator, ChainError> {
        let context = match parent {
            Some(parent) => parent.clone(),
            None => self.new_context(),
        };
        Ok(MemBlockCreator {
            chain: self.clone(),
            template,
            context,
            transaction_types: Vec::new(),
            transactions: Vec::new(),
            transaction_signatures: Vec::new(),
        })
    }

    fn save_process_data(&self, tag: &[u8], value: Vec<u8>) -> Result<(), ChainError> {
        self.inner().process_data.insert(tag.to_vec(), value);
        Ok(())
    }
}

pub(crate) struct MemBlockCreator {
    chain: MemChain,
    template: BlockTemplate,
    context: MemContext,
    transaction_types: Vec<TxType>,
    transactions: Vec<Transaction>,
    transaction_signatures: Vec<Vec<RecoverableSignature>>,
}

impl BlockCreator for MemBlockCreator {
    type Context = MemContext;

    fn snapshot(&mut self) -> usize {
        self.transactions.len()
    }

    fn revert(&mut self, snapshot: usize) {
        for (tx_type, transaction) in self
            .transaction_types
            .drain(snapshot..)
            .zip(self.transactions.drain(snapshot..))
        {
            self.context
                .included
                .remove(&transaction.hash(self.chain.chain_id, tx_type));
            self.context.executed -= 1;
        }
        self.transaction_signatures.truncate(snapshot);
    }

    fn add_transaction(&mut self, item: &PoolItem) -> Result<(), ChainError> {
        self.chain
            .execute(&mut self.context, item.tx_type, &item.transaction)?;
        self.transaction_types.push(item.tx_type);
        self.transactions.push(item.transaction.clone());
        self.transaction_signatures.push(item.signatures.clone());
        Ok(())
    }

    fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    fn finalize(mut self, timestamp: Timestamp) -> Result<(Block, MemContext), ChainError> {
        self.context.height = self.template.height;
        let header = Header {
            chain_id: self.template.chain_id,
            version: self.template.version,
            height: self.template.height,
            prev_hash: self.template.prev_hash,
            body_hash: Block::body_hash(
                &self.transaction_types,
                &self.transactions,
                &self.transaction_signatures,
            ),
            context_hash: context_hash(self.template.height, self.context.executed),
            timestamp,
            generator: self.template.generator,
            consensus_data: self.template.consensus_data,
        };
        let block = Block {
            header,
            transaction_types: self.transaction_types,
            transactions: self.transactions,
            transaction_signatures: self.transaction_signatures,
            signatures: Vec::new(),
        };
        Ok((block, self.context))
    }
}
