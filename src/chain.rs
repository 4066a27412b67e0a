//! Chain head: owns the committed chain, the head pointer, and the two
//! ticker loops that move proposals from the worker into storage.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blockpool::BlockPool;
use crate::config::{Limits, NodeConfig};
use crate::consensus::{ChainReader, Engine};
use crate::errors::{ChainError, ChainResult};
use crate::gas::{GasPool, DEFAULT_GAS_TARGET};
use crate::storage::Storage;
use crate::txpool::TxPool;
use crate::types::{unix_time, Address, Block, BlockHeader, Hash, Transaction};

const TICK_PERIOD: Duration = Duration::from_secs(3);

/// Caller-supplied genesis parameters, one field per header slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisBlock {
    pub height: u64,
    pub prev: Hash,
    pub timestamp: u64,
    pub nonce: u64,
    pub gas_target: u64,
    pub gas_tip: u64,
    pub gas_used: u64,
    pub difficulty: u64,
    pub total_difficulty: u64,
    pub data: Vec<u8>,
    pub validator_proof: Vec<u8>,
    pub consensus_proof: Vec<u8>,
    pub signature: Vec<u8>,
    pub validator: Address,
}

impl Default for GenesisBlock {
    fn default() -> Self {
        Self {
            height: 0,
            prev: Hash::default(),
            timestamp: unix_time(),
            nonce: 0,
            gas_target: 0,
            gas_tip: 0,
            gas_used: 0,
            difficulty: 0,
            total_difficulty: 0,
            data: Vec::new(),
            validator_proof: Vec::new(),
            consensus_proof: Vec::new(),
            signature: Vec::new(),
            validator: Address::default(),
        }
    }
}

impl GenesisBlock {
    pub fn to_block(&self) -> Block {
        Block::new(
            BlockHeader {
                height: self.height,
                prev: self.prev,
                timestamp: self.timestamp,
                nonce: self.nonce,
                gas_target: self.gas_target,
                gas_tip: self.gas_tip,
                gas_used: self.gas_used,
                difficulty: self.difficulty,
                total_difficulty: self.total_difficulty,
                data: self.data.clone(),
                validator_proof: self.validator_proof.clone(),
                consensus_proof: self.consensus_proof.clone(),
                signature: self.signature.clone(),
                validator: self.validator,
                size: 0,
            },
            Vec::new(),
        )
    }
}

struct HeadState {
    latest: Block,
    total_difficulty: u64,
}

struct ChainInner {
    engine: Arc<Engine>,
    storage: Storage,
    limits: Limits,
    consensus_proof: Vec<u8>,
    genesis: Block,
    head: RwLock<HeadState>,
    local_blocks: RwLock<Vec<Block>>,
    tx_pool: TxPool,
    block_pool: BlockPool,
    gas_pool: Arc<RwLock<GasPool>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Blockchain {
    inner: Arc<ChainInner>,
}

impl Blockchain {
    /// Opens (or bootstraps) the chain: ensures a genesis block, manufactures
    /// the height-1 bootstrap child when the store is fresh, and wires the
    /// transaction and block pools to the resulting head.
    pub fn new(
        storage: Storage,
        engine: Arc<Engine>,
        config: &NodeConfig,
        executor: Address,
        genesis: Option<GenesisBlock>,
    ) -> ChainResult<Self> {
        info!(chain_id = engine.chain_id(), "initializing blockchain");
        storage.init_tables()?;

        let genesis_block = match storage.block_by_height(0)? {
            Some(block) => block,
            None => {
                let block = genesis.unwrap_or_default().to_block();
                storage.commit_block(&block)?;
                info!(hash = %block.hash, "genesis block initialized");
                block
            }
        };

        let mut latest = storage.latest_block()?.ok_or(ChainError::BlockNotFound)?;
        if latest.height() == 0 {
            let header = BlockHeader {
                height: 1,
                prev: genesis_block.hash,
                timestamp: unix_time(),
                gas_target: DEFAULT_GAS_TARGET,
                difficulty: engine.difficulty(),
                ..BlockHeader::default()
            };
            let block = Block::new(header, Vec::new());
            storage.commit_block(&block)?;
            info!(height = 1, hash = %block.hash, "bootstrap block committed");
            latest = block;
        }

        let total_difficulty = latest.header.difficulty;
        info!(
            latest_height = latest.height(),
            latest_hash = %latest.hash,
            total_difficulty,
            "loaded latest block"
        );

        let consensus_proof = engine.consensus_proof(latest.height())?.to_vec();
        let gas_pool = Arc::new(RwLock::new(GasPool::new()));
        let tx_pool = TxPool::new(
            storage.clone(),
            executor,
            config.limits.minimal_gas_tip,
            consensus_proof.clone(),
            gas_pool.clone(),
        )?;
        let block_pool = BlockPool::new(
            engine.clone(),
            storage.clone(),
            latest.height(),
            config.limits.max_block_size,
            config.limits.max_proposal_size,
        )?;
        block_pool.sync_block_pool(latest.height() + 1)?;

        Ok(Self {
            inner: Arc::new(ChainInner {
                engine,
                storage,
                limits: config.limits.clone(),
                consensus_proof,
                genesis: genesis_block,
                head: RwLock::new(HeadState {
                    latest,
                    total_difficulty,
                }),
                local_blocks: RwLock::new(Vec::new()),
                tx_pool,
                block_pool,
                gas_pool,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Spawns the local-proposal and pool-processing loops.
    pub fn start(&self) {
        let local = self.inner.clone();
        let pool = self.inner.clone();
        let mut tasks = self.inner.tasks.lock();
        tasks.push(tokio::spawn(async move {
            let mut ticker = time::interval(TICK_PERIOD);
            loop {
                tokio::select! {
                    _ = local.cancel.cancelled() => {
                        info!("stopping local-blocks loop");
                        return;
                    }
                    _ = ticker.tick() => local.run_local_tick(),
                }
            }
        }));
        tasks.push(tokio::spawn(async move {
            let mut ticker = time::interval(TICK_PERIOD);
            loop {
                tokio::select! {
                    _ = pool.cancel.cancelled() => {
                        info!("stopping block-pool loop");
                        return;
                    }
                    _ = ticker.tick() => pool.run_pool_tick(),
                }
            }
        }));
    }

    /// Cancels both loops and waits for them to exit.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("blockchain processing stopped");
    }

    /// Enqueues a locally produced proposal; the local-proposal loop hands
    /// it to the block pool on the next tick. The head is untouched.
    pub fn add_block(&self, block: Block) -> ChainResult<()> {
        if !block.hash.is_valid() {
            return Err(ChainError::NilBlock);
        }
        self.inner.local_blocks.write().push(block);
        Ok(())
    }

    /// Ingests a block received from a peer. Heights at or below the head
    /// are rejected to keep the head strictly monotone.
    pub fn add_remote_block(&self, block: Block) -> ChainResult<()> {
        if !block.hash.is_valid() {
            return Err(ChainError::NilBlock);
        }
        if self.inner.storage.has_block(&block.hash)? {
            return Err(ChainError::BlockExists);
        }
        {
            let mut head = self.inner.head.write();
            if block.height() <= head.latest.height() {
                return Err(ChainError::InvalidBlockHeight);
            }
            self.inner.storage.commit_block(&block)?;
            head.total_difficulty += block.header.difficulty;
            head.latest = block.clone();
        }
        // Keep the proposal pipeline aligned with the remotely advanced head.
        if let Err(err) = self.inner.block_pool.sync_block_pool(block.height() + 1) {
            warn!(?err, "failed to sync block pool after remote block");
        }
        Ok(())
    }

    pub fn has_block(&self, hash: &Hash) -> bool {
        self.inner.storage.has_block(hash).unwrap_or_else(|err| {
            error!(?err, "block lookup failed");
            false
        })
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> ChainResult<Option<Block>> {
        self.inner.storage.block_by_hash(hash)
    }

    pub fn get_block_by_height(&self, height: u64) -> ChainResult<Option<Block>> {
        self.inner.storage.block_by_height(height)
    }

    pub fn get_latest_block(&self) -> Block {
        self.inner.head.read().latest.clone()
    }

    pub fn total_difficulty(&self) -> u64 {
        self.inner.head.read().total_difficulty
    }

    pub fn genesis(&self) -> &Block {
        &self.inner.genesis
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.inner.engine
    }

    pub fn chain_id(&self) -> u64 {
        self.inner.engine.chain_id()
    }

    pub fn protocol_hash(&self) -> Hash {
        self.inner.engine.protocol_hash()
    }

    pub fn consensus_proof(&self) -> &[u8] {
        &self.inner.consensus_proof
    }

    pub fn difficulty(&self) -> u64 {
        self.inner.engine.difficulty()
    }

    pub fn gas_target(&self) -> u64 {
        self.inner.gas_pool.read().gas_target()
    }

    pub fn max_tx_per_block(&self) -> u64 {
        self.inner.limits.max_tx_per_block
    }

    /// Admits a transaction: size-capped, gas-checked by the pool, and
    /// recorded under `transactions/rejected/` when pricing throws it out.
    pub fn add_transaction(&self, tx: Transaction) -> ChainResult<()> {
        if tx.size() > self.inner.limits.max_tx_size {
            self.record_rejected(&tx);
            return Err(ChainError::Transaction(format!(
                "transaction size {} exceeds cap {}",
                tx.size(),
                self.inner.limits.max_tx_size
            )));
        }
        match self.inner.tx_pool.add_transaction(tx.clone()) {
            Err(err @ ChainError::Transaction(_)) => {
                self.record_rejected(&tx);
                Err(err)
            }
            other => other,
        }
    }

    /// Snapshot of the sealed transaction queue.
    pub fn get_transactions(&self) -> Vec<Transaction> {
        self.inner.tx_pool.get_transactions()
    }

    fn record_rejected(&self, tx: &Transaction) {
        if let Err(err) = self.inner.storage.record_rejected(tx) {
            warn!(?err, "failed to record rejected transaction");
        }
    }
}

impl ChainInner {
    /// One local-proposal tick: hand the first proposal at the next height
    /// to the block pool and drop it from the queue.
    fn run_local_tick(&self) {
        let snapshot = self.local_blocks.read().clone();
        if snapshot.is_empty() {
            return;
        }

        let next_height = self.head.read().latest.height() + 1;
        info!(local_blocks = snapshot.len(), "processing local proposals");
        for block in snapshot {
            if block.height() == next_height {
                if let Err(err) = self.block_pool.add_proposed_block(block.clone()) {
                    error!(?err, "failed to add proposed block");
                    continue;
                }
                self.local_blocks.write().retain(|b| b.hash != block.hash);
                break;
            }
        }
    }

    /// One pool-processing tick: seal pending transactions, retarget gas,
    /// elect a winner, and commit it if it extends the head.
    fn run_pool_tick(&self) {
        let sealed = self.tx_pool.process_transactions();
        if sealed > 0 {
            debug!(sealed, "sealed pending transactions");
        }

        {
            let latest_gas_target = self.head.read().latest.header.gas_target;
            if let Err(err) = self.gas_pool.write().sync(latest_gas_target) {
                warn!(?err, "gas retarget skipped");
            }
        }

        let winner = match self.block_pool.process_proposed_blocks() {
            Ok(Some(block)) => block,
            Ok(None) => return,
            Err(err) => {
                error!(?err, "block pool processing failed");
                return;
            }
        };

        info!(height = winner.height(), hash = %winner.hash, "processing proposed block");

        let expected = self.head.read().latest.height() + 1;
        if winner.height() == expected {
            let previous_timestamp = match self.storage.latest_block() {
                Ok(Some(block)) => block.header.timestamp,
                Ok(None) | Err(_) => 0,
            };

            if let Err(err) = self.storage.commit_block(&winner) {
                error!(?err, "failed to save new block");
                return;
            }

            let committed: Vec<Hash> = winner.transactions.iter().map(|tx| tx.hash).collect();
            self.tx_pool.remove_transactions(&committed);
            if let Err(err) = self.tx_pool.persist(winner.height()) {
                warn!(?err, "failed to persist transaction pool state");
            }

            let total_difficulty = {
                let mut head = self.head.write();
                head.total_difficulty += winner.header.difficulty;
                head.latest = winner.clone();
                head.total_difficulty
            };

            let elapsed = unix_time().saturating_sub(previous_timestamp);
            info!(
                height = winner.height(),
                total_difficulty,
                elapsed_secs = elapsed,
                "committed new block"
            );
        }

        if let Err(err) = self.block_pool.sync_block_pool(winner.height() + 1) {
            error!(?err, "failed to sync block pool");
        }
    }
}

impl ChainReader for Blockchain {
    fn block_by_hash(&self, hash: &Hash) -> ChainResult<Option<Block>> {
        self.inner.storage.block_by_hash(hash)
    }

    fn block_by_height(&self, height: u64) -> ChainResult<Option<Block>> {
        self.inner.storage.block_by_height(height)
    }

    fn latest_block(&self) -> ChainResult<Block> {
        Ok(self.inner.head.read().latest.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::gas::DEFAULT_GAS_TARGET;

    fn test_setup() -> (tempfile::TempDir, Blockchain, Arc<Engine>, Keypair) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let keypair = Keypair::from_secret_bytes(&[0x37; 32]).unwrap();
        let validator = keypair.address();
        let engine = Arc::new(Engine::new(1_000, 100, 10, 0, vec![validator]));
        engine.select_validator();
        let config = NodeConfig::default();
        let chain = Blockchain::new(storage, engine.clone(), &config, validator, None).unwrap();
        (dir, chain, engine, keypair)
    }

    fn proposal_at(
        chain: &Blockchain,
        engine: &Engine,
        keypair: &Keypair,
        parent: &Block,
    ) -> Block {
        let height = parent.height() + 1;
        let header = BlockHeader {
            height,
            prev: parent.hash,
            timestamp: unix_time(),
            nonce: 0xdead_beef,
            gas_target: chain.gas_target(),
            difficulty: parent.header.difficulty,
            validator: keypair.address(),
            validator_proof: engine.validator_proof().to_vec(),
            consensus_proof: engine.consensus_proof(height).unwrap().to_vec(),
            ..BlockHeader::default()
        };
        let mut block = Block::new(header, Vec::new());
        let adjusted = engine.adjust_difficulty(&block, parent);
        block.header.difficulty = adjusted;
        block.sign(keypair).unwrap();
        block.refresh_hash();
        engine.seal_block(&mut block).unwrap();
        block
    }

    #[test]
    fn fresh_store_bootstraps_to_height_one() {
        let (_dir, chain, _engine, _keypair) = test_setup();
        let head = chain.get_latest_block();
        assert_eq!(head.height(), 1);
        assert_eq!(head.prev(), chain.genesis().hash);
        assert_eq!(chain.total_difficulty(), head.header.difficulty);
        assert!(chain.get_block_by_height(0).unwrap().is_some());
    }

    #[test]
    fn local_proposal_commits_through_both_ticks() {
        let (_dir, chain, engine, keypair) = test_setup();
        let head = chain.get_latest_block();
        let block = proposal_at(&chain, &engine, &keypair, &head);
        engine.verify_block(&chain, &block).unwrap();

        chain.add_block(block.clone()).unwrap();
        // Enqueueing never moves the head.
        assert_eq!(chain.get_latest_block().height(), 1);

        chain.inner.run_local_tick();
        chain.inner.run_pool_tick();

        let committed = chain.get_latest_block();
        assert_eq!(committed.height(), 2);
        assert_eq!(committed.hash, block.hash);
        assert!(committed.slot_hash.is_valid());
        assert_eq!(
            chain.total_difficulty(),
            head.header.difficulty + block.header.difficulty
        );
        engine.verify_chain(&chain).unwrap();
    }

    #[test]
    fn committed_chain_links_back_to_genesis() {
        let (_dir, chain, engine, keypair) = test_setup();
        let mut parent = chain.get_latest_block();
        for _ in 0..3 {
            let block = proposal_at(&chain, &engine, &keypair, &parent);
            chain.add_block(block.clone()).unwrap();
            chain.inner.run_local_tick();
            chain.inner.run_pool_tick();
            parent = block;
        }

        let mut cursor = chain.get_latest_block();
        assert_eq!(cursor.height(), 4);
        while cursor.height() > 0 {
            let parent = chain
                .get_block_by_hash(&cursor.prev())
                .unwrap()
                .expect("parent reachable by prev");
            assert_eq!(parent.height() + 1, cursor.height());
            cursor = parent;
        }
    }

    #[test]
    fn remote_blocks_respect_head_monotonicity() {
        let (_dir, chain, engine, keypair) = test_setup();
        let head = chain.get_latest_block();
        let block = proposal_at(&chain, &engine, &keypair, &head);

        chain.add_remote_block(block.clone()).unwrap();
        assert_eq!(chain.get_latest_block().height(), 2);

        // The same height again: rejected, the head never rolls back.
        let mut sibling = proposal_at(&chain, &engine, &keypair, &head);
        sibling.header.nonce = 0x5eed;
        sibling.refresh_hash();
        sibling.sign(&keypair).unwrap();
        assert!(matches!(
            chain.add_remote_block(sibling),
            Err(ChainError::InvalidBlockHeight)
        ));

        // Re-sending the identical block reports the duplicate instead.
        assert!(matches!(
            chain.add_remote_block(block),
            Err(ChainError::BlockExists)
        ));
    }

    #[test]
    fn oversized_transactions_are_rejected_and_recorded() {
        let (_dir, chain, _engine, _keypair) = test_setup();
        let mut tx = Transaction::default();
        tx.data.data = vec![0; 2 * 1024 * 1024];
        tx.refresh_hash();
        assert!(matches!(
            chain.add_transaction(tx.clone()),
            Err(ChainError::Transaction(_))
        ));
        let rejected: Option<Transaction> = chain
            .inner
            .storage
            .read(
                crate::storage::tables::TRANSACTIONS_REJECTED,
                &tx.hash.to_cxid(),
            )
            .unwrap();
        assert!(rejected.is_some());
    }

    #[test]
    fn sealed_transactions_reach_the_committed_block() {
        let (_dir, chain, engine, keypair) = test_setup();
        let mut tx = Transaction::new(
            keypair.address(),
            Address::from_slice(&[2; 15]),
            primitive_types::U256::from(5u64),
            Vec::new(),
            0,
            0,
            crate::types::Version::LEGACY,
            Vec::new(),
            DEFAULT_GAS_TARGET,
        )
        .unwrap();
        tx.sign(&keypair).unwrap();
        chain.add_transaction(tx.clone()).unwrap();

        // Sealing happens on the pool tick; the worker then finds it.
        chain.inner.run_pool_tick();
        let sealed = chain.get_transactions();
        assert_eq!(sealed.len(), 1);
        assert!(sealed[0].seal_hash.is_valid());

        let head = chain.get_latest_block();
        let mut block = proposal_at(&chain, &engine, &keypair, &head);
        block.transactions = sealed;
        block.header.gas_used = tx.gas();
        block.refresh_hash();
        block.sign(&keypair).unwrap();
        engine.seal_block(&mut block).unwrap();

        chain.add_block(block.clone()).unwrap();
        chain.inner.run_local_tick();
        chain.inner.run_pool_tick();

        assert_eq!(chain.get_latest_block().height(), 2);
        assert!(chain.get_transactions().is_empty());
        let stored = chain.get_block_by_height(2).unwrap().unwrap();
        assert_eq!(stored.transactions.len(), 1);
        assert_eq!(stored.transactions[0].hash, tx.hash);
    }
}
