//! Proposal builder: a periodic worker that assembles, signs, and seals
//! candidate blocks from the sealed transaction queue.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chain::Blockchain;
use crate::consensus::Engine;
use crate::crypto::Keypair;
use crate::errors::ChainResult;
use crate::types::{unix_nanos, unix_time, Address, Block, BlockHeader, Transaction};

/// The proposer identity: its address and block-signing key.
pub struct Miner {
    address: Address,
    keypair: Keypair,
}

impl Miner {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            address: keypair.address(),
            keypair,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn sign_block(&self, block: &mut Block) -> ChainResult<()> {
        block.sign(&self.keypair)
    }
}

struct WorkerInner {
    miner: Miner,
    engine: Arc<Engine>,
    chain: Blockchain,
    delay: u64,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn new(miner: Miner, engine: Arc<Engine>, chain: Blockchain, delay: u64) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                miner,
                engine,
                chain,
                delay,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn run(&self) {
        let inner = self.inner.clone();
        self.inner.tasks.lock().push(tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(inner.delay));
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => {
                        info!("stopping proposal worker");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = inner.try_produce_block() {
                            warn!(?err, "block production failed");
                        }
                    }
                }
            }
        }));
    }

    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl WorkerInner {
    /// One proposal attempt. Ticks with a degenerate nonce or an empty
    /// transaction selection produce nothing; a verification failure drops
    /// the candidate without touching the chain.
    fn try_produce_block(&self) -> ChainResult<()> {
        let latest = self.chain.get_latest_block();

        let nonce = next_nonce(latest.header.nonce);
        if nonce == 0 || nonce == latest.header.nonce || nonce == !latest.header.nonce {
            return Ok(());
        }

        let (transactions, gas_used, gas_tip) = select_transactions(
            self.chain.get_transactions(),
            self.chain.gas_target(),
            self.chain.max_tx_per_block(),
        );
        if transactions.is_empty() {
            return Ok(());
        }

        let height = latest.height() + 1;
        let header = BlockHeader {
            height,
            prev: latest.hash,
            timestamp: unix_time(),
            nonce,
            gas_target: self.chain.gas_target(),
            gas_tip,
            gas_used,
            difficulty: latest.header.difficulty,
            validator: self.miner.address(),
            validator_proof: self.engine.validator_proof().to_vec(),
            consensus_proof: self.engine.consensus_proof(height)?.to_vec(),
            ..BlockHeader::default()
        };

        let mut block = Block::new(header, transactions);
        block.header.difficulty = self.engine.adjust_difficulty(&block, &latest);
        block.header.size = block.header.calculate_size();
        block.refresh_hash();

        self.miner.sign_block(&mut block)?;
        self.engine.seal_block(&mut block)?;

        self.engine.verify_block(&self.chain, &block)?;
        info!(height, hash = %block.hash, txs = block.transactions.len(), "proposing block");
        self.chain.add_block(block)?;

        if let Err(err) = self.engine.verify_chain(&self.chain) {
            warn!(?err, "chain verification failed");
        }
        Ok(())
    }
}

/// Fresh proposal nonce mixed from the parent nonce, system randomness, and
/// the wall clock. Degenerate values are the caller's signal to skip.
fn next_nonce(prev_nonce: u64) -> u64 {
    let mut rng = rand::thread_rng();
    let nonce = prev_nonce ^ rng.gen::<u64>() ^ unix_nanos();
    nonce ^ rng.gen_range(0..1u64 << 16)
}

/// Greedy selection by descending gas price under the block gas target,
/// bounded by the per-block transaction cap. Returns the selected set with
/// its total gas and tip sums.
fn select_transactions(
    mut candidates: Vec<Transaction>,
    gas_limit: u64,
    max_count: u64,
) -> (Vec<Transaction>, u64, u64) {
    candidates.sort_by(|a, b| b.gas_price().cmp(&a.gas_price()));

    let mut selected = Vec::new();
    let mut gas_used = 0u64;
    let mut gas_tip = 0u64;
    for tx in candidates {
        if selected.len() as u64 >= max_count {
            break;
        }
        if gas_used + tx.gas() > gas_limit {
            continue;
        }
        gas_used += tx.gas();
        gas_tip += tx.gas_tip();
        selected.push(tx);
    }
    (selected, gas_used, gas_tip)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx_with(gas_price: u64, gas: u64, tip: u64, tag: u8) -> Transaction {
        let mut tx = Transaction::default();
        tx.data.gas_price = gas_price;
        tx.data.gas = gas;
        tx.data.gas_tip = tip;
        tx.data.nonce = tag as u64;
        tx.refresh_hash();
        tx
    }

    #[test]
    fn selection_prefers_expensive_transactions() {
        let txs = vec![
            tx_with(1, 400, 10, 0),
            tx_with(9, 400, 30, 1),
            tx_with(5, 400, 20, 2),
        ];
        let (selected, gas_used, gas_tip) = select_transactions(txs, 1_000, 1_000);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].gas_price(), 9);
        assert_eq!(selected[1].gas_price(), 5);
        assert_eq!(gas_used, 800);
        assert_eq!(gas_tip, 50);
    }

    #[test]
    fn selection_skips_over_budget_and_keeps_scanning() {
        let txs = vec![tx_with(9, 900, 0, 0), tx_with(5, 100, 0, 1)];
        let (selected, gas_used, _) = select_transactions(txs, 950, 1_000);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].gas_price(), 9);
        assert_eq!(gas_used, 900);
    }

    #[test]
    fn selection_honors_the_count_cap() {
        let txs = vec![
            tx_with(3, 10, 0, 0),
            tx_with(2, 10, 0, 1),
            tx_with(1, 10, 0, 2),
        ];
        let (selected, _, _) = select_transactions(txs, 1_000, 2);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn nonce_mixes_away_from_the_parent() {
        let mut distinct = false;
        for _ in 0..8 {
            let nonce = next_nonce(42);
            if nonce != 42 && nonce != 0 && nonce != !42 {
                distinct = true;
                break;
            }
        }
        assert!(distinct);
    }
}
