use std::sync::Arc;

use parking_lot::RwLock;

use crate::consensus::Engine;
use crate::crypto::digest256;
use crate::errors::{ChainError, ChainResult};
use crate::storage::{tables, Storage};
use crate::types::{u64_to_bytes, Address, Block, Hash};

struct PoolState {
    proposed: Vec<Block>,
    expected_height: u64,
    slot_hash: Hash,
}

/// Staging area for proposed blocks at the next expected height. Each
/// processing tick elects one winner and stamps it with the current slot
/// hash; slot hashes chain across heights and are logged append-only.
pub struct BlockPool {
    engine: Arc<Engine>,
    storage: Storage,
    max_block_size: u64,
    max_proposal_size: u64,
    epoch: u64,
    state: RwLock<PoolState>,
}

impl BlockPool {
    pub fn new(
        engine: Arc<Engine>,
        storage: Storage,
        latest_height: u64,
        max_block_size: u64,
        max_proposal_size: u64,
    ) -> ChainResult<Self> {
        if !storage.exist(tables::BLOCK_POOL)? {
            storage.create(tables::BLOCK_POOL)?;
        }

        let consensus_proof = engine.consensus_proof(latest_height)?;
        let epoch = engine.epoch();
        let slot_hash = calc_slot_hash(
            &consensus_proof,
            &engine.current_validator(),
            epoch,
            latest_height,
            &Hash::default(),
        );

        Ok(Self {
            engine,
            storage,
            max_block_size,
            max_proposal_size,
            epoch,
            state: RwLock::new(PoolState {
                proposed: Vec::new(),
                expected_height: latest_height,
                slot_hash,
            }),
        })
    }

    pub fn expected_height(&self) -> u64 {
        self.state.read().expected_height
    }

    pub fn current_slot_hash(&self) -> Hash {
        self.state.read().slot_hash
    }

    pub fn add_proposed_block(&self, block: Block) -> ChainResult<()> {
        if block.header.size > self.max_proposal_size {
            return Err(ChainError::InvalidBlockSize);
        }
        self.state.write().proposed.push(block);
        Ok(())
    }

    /// Elects this slot's winner: proposals at the expected height within
    /// the size cap, highest gas target first. The winner receives the
    /// current slot hash, the slot hash is appended to the slot log, and
    /// the buffer resets.
    pub fn process_proposed_blocks(&self) -> ChainResult<Option<Block>> {
        let mut state = self.state.write();

        let mut valid: Vec<Block> = state
            .proposed
            .iter()
            .filter(|b| b.height() == state.expected_height)
            .filter(|b| b.header.size <= self.max_block_size)
            .cloned()
            .collect();
        if valid.is_empty() {
            return Ok(None);
        }
        valid.sort_by(|a, b| b.header.gas_target.cmp(&a.header.gas_target));

        let mut winner = valid.swap_remove(0);
        winner.set_slot_hash(state.slot_hash);
        self.append_slot_hash(&winner.slot_hash)?;
        state.proposed.clear();

        Ok(Some(winner))
    }

    /// Advances to a new expected height, folding the previous slot hash
    /// into the next one.
    pub fn sync_block_pool(&self, latest_height: u64) -> ChainResult<()> {
        let consensus_proof = self.engine.consensus_proof(latest_height)?;
        let mut state = self.state.write();
        state.expected_height = latest_height;
        state.slot_hash = calc_slot_hash(
            &consensus_proof,
            &self.engine.current_validator(),
            self.epoch,
            latest_height,
            &state.slot_hash,
        );
        Ok(())
    }

    fn append_slot_hash(&self, hash: &Hash) -> ChainResult<()> {
        let next_index = self.storage.count(tables::BLOCK_POOL)? + 1;
        self.storage
            .write(tables::BLOCK_POOL, &next_index.to_string(), &hash.to_cxid())
    }
}

/// `H( consensus_proof ‖ validator ‖ epoch(8) ‖ height(8) ‖ parent_slot_hash )`.
pub fn calc_slot_hash(
    consensus_proof: &[u8],
    validator: &Address,
    epoch: u64,
    height: u64,
    parent: &Hash,
) -> Hash {
    let mut buf = Vec::with_capacity(consensus_proof.len() + 15 + 8 + 8 + 32);
    buf.extend_from_slice(consensus_proof);
    buf.extend_from_slice(validator.as_bytes());
    buf.extend_from_slice(&u64_to_bytes(epoch));
    buf.extend_from_slice(&u64_to_bytes(height));
    buf.extend_from_slice(parent.as_bytes());
    digest256(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockHeader;

    const MAX_SIZE: u64 = 1024 * 1024;

    fn pool() -> (tempfile::TempDir, BlockPool) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.init_tables().unwrap();
        let engine = Arc::new(Engine::new(
            1000,
            100,
            10,
            0,
            vec![Address::from_slice(&[0xaa; 15])],
        ));
        engine.select_validator();
        let pool = BlockPool::new(engine, storage, 1, MAX_SIZE, MAX_SIZE).unwrap();
        (dir, pool)
    }

    fn proposal(height: u64, gas_target: u64) -> Block {
        Block::new(
            BlockHeader {
                height,
                gas_target,
                ..BlockHeader::default()
            },
            Vec::new(),
        )
    }

    #[test]
    fn empty_pool_elects_nobody() {
        let (_dir, pool) = pool();
        assert!(pool.process_proposed_blocks().unwrap().is_none());
    }

    #[test]
    fn winner_has_highest_gas_target_at_expected_height() {
        let (_dir, pool) = pool();
        pool.add_proposed_block(proposal(1, 500)).unwrap();
        pool.add_proposed_block(proposal(1, 900)).unwrap();
        pool.add_proposed_block(proposal(2, 9_999)).unwrap();

        let winner = pool.process_proposed_blocks().unwrap().unwrap();
        assert_eq!(winner.height(), 1);
        assert_eq!(winner.header.gas_target, 900);
        assert_eq!(winner.slot_hash, pool.current_slot_hash());

        // The buffer resets after an election.
        assert!(pool.process_proposed_blocks().unwrap().is_none());
    }

    #[test]
    fn oversized_blocks_never_win() {
        let (_dir, pool) = pool();
        let mut fat = proposal(1, 900);
        fat.header.size = MAX_SIZE + 1;
        // Bypass the proposal cap to exercise the election-side filter.
        pool.state.write().proposed.push(fat);
        pool.add_proposed_block(proposal(1, 500)).unwrap();

        let winner = pool.process_proposed_blocks().unwrap().unwrap();
        assert_eq!(winner.header.gas_target, 500);
    }

    #[test]
    fn proposal_cap_rejects_oversized_submission() {
        let (_dir, pool) = pool();
        let mut fat = proposal(1, 900);
        fat.header.size = MAX_SIZE + 1;
        assert!(matches!(
            pool.add_proposed_block(fat),
            Err(ChainError::InvalidBlockSize)
        ));
    }

    #[test]
    fn slot_hashes_chain_across_syncs() {
        let (_dir, pool) = pool();
        let first = pool.current_slot_hash();
        pool.sync_block_pool(2).unwrap();
        let second = pool.current_slot_hash();
        assert_ne!(first, second);
        assert_eq!(pool.expected_height(), 2);

        // The next slot hash commits to the previous one.
        pool.sync_block_pool(3).unwrap();
        assert_ne!(pool.current_slot_hash(), second);
    }

    #[test]
    fn elections_append_to_the_slot_log() {
        let (_dir, pool) = pool();
        pool.add_proposed_block(proposal(1, 100)).unwrap();
        pool.process_proposed_blocks().unwrap().unwrap();
        assert_eq!(pool.storage.count(tables::BLOCK_POOL).unwrap(), 1);
    }
}
