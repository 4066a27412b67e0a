use std::sync::Arc;

use parking_lot::RwLock;
use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::crypto::{create_address, digest256};
use crate::errors::{ChainError, ChainResult};
use crate::gas::GasPool;
use crate::storage::{tables, Storage};
use crate::types::{unix_time, Address, Hash, Transaction};

const POOL_TABLE: &str = "txpool/";

/// Three days, the pool's bookkeeping epoch.
const POOL_EPOCH_SECS: u64 = 3 * 24 * 60 * 60;

/// Persisted pool snapshot, written under `txpool/` for the pool itself and
/// under `txpool/block_%s` at every commit height.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxPoolState {
    pub balance: U256,
    pub hash: Hash,
    pub timestamp: u64,
    pub epoch: u64,
    pub executor: Address,
    pub latest_update: u64,
}

struct PoolState {
    pending: Vec<Transaction>,
    sealed: Vec<Transaction>,
    balance: U256,
    total_transactions: u64,
}

/// Exclusive per-executor pool: transactions accumulate in `pending`, get
/// sealed into `sealed`, and leave when a block carrying them commits.
pub struct TxPool {
    pool_address: Address,
    executor: Address,
    minimal_gas_tip: u64,
    consensus_proof: Vec<u8>,
    gas_pool: Arc<RwLock<GasPool>>,
    next_epoch: u64,
    timestamp: u64,
    storage: Storage,
    state: RwLock<PoolState>,
}

impl TxPool {
    pub fn new(
        storage: Storage,
        executor: Address,
        minimal_gas_tip: u64,
        consensus_proof: Vec<u8>,
        gas_pool: Arc<RwLock<GasPool>>,
    ) -> ChainResult<Self> {
        if !storage.exist(POOL_TABLE)? {
            storage.create(POOL_TABLE)?;
        }

        let salt = digest256(executor.as_bytes());
        let pool_address = create_address(&executor, 0, &salt);

        let now = unix_time();
        let mut pool = Self {
            pool_address,
            executor,
            minimal_gas_tip,
            consensus_proof,
            gas_pool,
            next_epoch: now + POOL_EPOCH_SECS,
            timestamp: now,
            storage,
            state: RwLock::new(PoolState {
                pending: Vec::new(),
                sealed: Vec::new(),
                balance: U256::zero(),
                total_transactions: 0,
            }),
        };

        match pool
            .storage
            .read::<TxPoolState>(POOL_TABLE, &pool_address.to_cxid())?
        {
            Some(saved) => {
                pool.timestamp = saved.timestamp;
                pool.next_epoch = saved.epoch;
                pool.state.get_mut().balance = saved.balance;
            }
            None => pool.save()?,
        }

        Ok(pool)
    }

    pub fn pool_address(&self) -> Address {
        self.pool_address
    }

    pub fn executor(&self) -> Address {
        self.executor
    }

    pub fn balance(&self) -> U256 {
        self.state.read().balance
    }

    /// Transactions ever admitted, across both queues.
    pub fn total_transactions(&self) -> u64 {
        self.state.read().total_transactions
    }

    pub fn consensus_proof(&self) -> &[u8] {
        &self.consensus_proof
    }

    /// Admits a transaction into `pending`. Membership is at-most-once by
    /// content hash across both queues.
    pub fn add_transaction(&self, tx: Transaction) -> ChainResult<()> {
        if tx.gas_tip() < self.minimal_gas_tip {
            return Err(ChainError::Transaction(format!(
                "gas tip {} below pool minimum {}",
                tx.gas_tip(),
                self.minimal_gas_tip
            )));
        }
        if tx.gas_tip() > tx.gas() {
            return Err(ChainError::Transaction(format!(
                "gas tip {} exceeds gas {}",
                tx.gas_tip(),
                tx.gas()
            )));
        }
        let gas_target = self.gas_pool.read().gas_target();
        if tx.gas() > gas_target {
            return Err(ChainError::Transaction(format!(
                "gas {} exceeds target {gas_target}",
                tx.gas()
            )));
        }

        let mut state = self.state.write();
        let known = state
            .pending
            .iter()
            .chain(state.sealed.iter())
            .any(|existing| existing.hash == tx.hash);
        if known {
            return Err(ChainError::AlreadyExists);
        }

        state.pending.push(tx);
        state.total_transactions += 1;
        Ok(())
    }

    /// Seals every pending transaction in one pass and moves it to `sealed`.
    /// Idempotent on an empty queue. Returns how many were sealed.
    pub fn process_transactions(&self) -> usize {
        let pool_digest = digest256(self.pool_address.as_bytes());
        let executor_digest = digest256(self.executor.as_bytes());

        let mut state = self.state.write();
        let drained: Vec<Transaction> = state.pending.drain(..).collect();
        let sealed_count = drained.len();
        for mut tx in drained {
            let mut preimage = [0u8; 96];
            preimage[..32].copy_from_slice(pool_digest.as_bytes());
            preimage[32..64].copy_from_slice(executor_digest.as_bytes());
            preimage[64..].copy_from_slice(tx.hash.as_bytes());
            tx.seal(digest256(&preimage));
            state.sealed.push(tx);
        }
        sealed_count
    }

    /// Snapshot of the sealed queue.
    pub fn get_transactions(&self) -> Vec<Transaction> {
        self.state.read().sealed.clone()
    }

    /// Drops committed transactions from both queues.
    pub fn remove_transactions(&self, hashes: &[Hash]) {
        let mut state = self.state.write();
        state.sealed.retain(|tx| !hashes.contains(&tx.hash));
        state.pending.retain(|tx| !hashes.contains(&tx.hash));
    }

    pub fn add_balance(&self, amount: U256) {
        let mut state = self.state.write();
        state.balance = state.balance.saturating_add(amount);
    }

    fn snapshot(&self) -> TxPoolState {
        TxPoolState {
            balance: self.balance(),
            hash: digest256(self.pool_address.as_bytes()),
            timestamp: self.timestamp,
            epoch: self.next_epoch,
            executor: self.executor,
            latest_update: unix_time(),
        }
    }

    fn save(&self) -> ChainResult<()> {
        self.storage
            .write(POOL_TABLE, &self.pool_address.to_cxid(), &self.snapshot())
    }

    /// Persists the pool row and a height-scoped snapshot after a commit.
    pub fn persist(&self, height: u64) -> ChainResult<()> {
        self.save()?;
        self.storage.write(
            &tables::txpool_at_height(height),
            &self.pool_address.to_cxid(),
            &self.snapshot(),
        )
    }
}
