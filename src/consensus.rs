//! Proof-of-authority engine: proof construction, block sealing and
//! verification, and the dynamic difficulty controller.

use parking_lot::RwLock;

use crate::crypto::digest256;
use crate::errors::{ChainError, ChainResult};
use crate::types::{bytes_to_u64, u64_to_bytes, Address, Block, Hash};

pub const MIN_DIFFICULTY: u64 = 1;
pub const MAX_DIFFICULTY: u64 = u64::MAX;
pub const PROOF_LEN: usize = 64;

/// Allowed relative drift between a block's difficulty and the locally
/// recomputed expectation.
const DIFFICULTY_DRIFT_MARGIN: f64 = 0.1;

const PROTOCOL_TAG: &[u8] = b"PowEngine";

/// Read access to the committed chain, as needed by verification.
pub trait ChainReader {
    fn block_by_hash(&self, hash: &Hash) -> ChainResult<Option<Block>>;
    fn block_by_height(&self, height: u64) -> ChainResult<Option<Block>>;
    fn latest_block(&self) -> ChainResult<Block>;
}

struct EngineState {
    difficulty: u64,
    current_validator: Address,
}

pub struct Engine {
    epoch: u64,
    delay: u64,
    chain_id: u64,
    validators: Vec<Address>,
    protocol_hash: Hash,
    state: RwLock<EngineState>,
}

impl Engine {
    pub fn new(
        epoch: u64,
        difficulty: u64,
        delay: u64,
        chain_id: u64,
        validators: Vec<Address>,
    ) -> Self {
        Self {
            epoch,
            delay,
            chain_id,
            validators,
            protocol_hash: digest256(PROTOCOL_TAG),
            state: RwLock::new(EngineState {
                difficulty,
                current_validator: Address::default(),
            }),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn delay(&self) -> u64 {
        self.delay
    }

    pub fn protocol_hash(&self) -> Hash {
        self.protocol_hash
    }

    pub fn difficulty(&self) -> u64 {
        self.state.read().difficulty
    }

    pub fn current_validator(&self) -> Address {
        self.state.read().current_validator
    }

    pub fn validator_exists(&self, address: &Address) -> bool {
        self.validators.contains(address)
    }

    /// Deterministic single-proposer selection; pure and idempotent within
    /// an epoch. An empty validator set yields the zero address.
    pub fn select_validator(&self) -> Address {
        let Some(next) = self.validators.first().copied() else {
            return Address::default();
        };
        self.state.write().current_validator = next;
        next
    }

    /// `chain_id(8) ‖ height(8) ‖ epoch(8) ‖ validator_count(8) ‖ protocol_hash(32)`.
    pub fn consensus_proof(&self, height: u64) -> ChainResult<[u8; PROOF_LEN]> {
        if height == 0 {
            return Err(ChainError::InvalidBlockHeight);
        }
        let mut proof = [0u8; PROOF_LEN];
        proof[..8].copy_from_slice(&u64_to_bytes(self.chain_id));
        proof[8..16].copy_from_slice(&u64_to_bytes(height));
        proof[16..24].copy_from_slice(&u64_to_bytes(self.epoch));
        proof[24..32].copy_from_slice(&u64_to_bytes(self.validators.len() as u64));
        proof[32..].copy_from_slice(self.protocol_hash.as_bytes());
        Ok(proof)
    }

    /// `chain_id(8) ‖ epoch(8) ‖ validator(15) ‖ zero(1) ‖ protocol_hash(32)`.
    pub fn validator_proof(&self) -> [u8; PROOF_LEN] {
        let mut proof = [0u8; PROOF_LEN];
        proof[..8].copy_from_slice(&u64_to_bytes(self.chain_id));
        proof[8..16].copy_from_slice(&u64_to_bytes(self.epoch));
        proof[16..31].copy_from_slice(self.current_validator().as_bytes());
        proof[32..].copy_from_slice(self.protocol_hash.as_bytes());
        proof
    }

    /// Seals a block with `H( H(consensus_proof) ‖ H(validator_proof) )`.
    pub fn seal_block(&self, block: &mut Block) -> ChainResult<()> {
        let consensus_proof = self.consensus_proof(block.height())?;
        let validator_proof = self.validator_proof();

        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(digest256(&consensus_proof).as_bytes());
        buf[32..].copy_from_slice(digest256(&validator_proof).as_bytes());
        block.seal(digest256(&buf));
        Ok(())
    }

    pub fn verify_block<C: ChainReader>(&self, chain: &C, block: &Block) -> ChainResult<()> {
        let parent_height = block
            .height()
            .checked_sub(1)
            .ok_or(ChainError::InvalidBlockHeight)?;
        let parent = chain
            .block_by_height(parent_height)?
            .ok_or(ChainError::NilPreviousBlock)?;

        if parent.hash != block.prev() {
            return Err(ChainError::InvalidBlockHash);
        }

        self.verify_consensus_proof(block, &parent)?;

        if !self.validator_exists(&block.validator()) {
            return Err(ChainError::InvalidValidator);
        }

        self.verify_validator_proof(block)?;

        let latest = chain.latest_block()?;
        if block.height() <= latest.height() {
            return Err(ChainError::InvalidBlockHeight);
        }
        if block.prev() != latest.hash {
            return Err(ChainError::InvalidBlockHash);
        }
        if chain.block_by_height(block.height())?.is_some() {
            return Err(ChainError::DuplicatedBlock);
        }
        if !block.seal_hash.is_valid() {
            return Err(ChainError::InvalidSealHash);
        }

        Ok(())
    }

    /// Walks the committed chain from height 2, checking hash integrity,
    /// parent linkage, and difficulty drift on every block.
    pub fn verify_chain<C: ChainReader>(&self, chain: &C) -> ChainResult<()> {
        let latest = chain.latest_block()?;
        if latest.height() == 0 {
            return Ok(());
        }

        for height in 2..=latest.height() {
            let current = chain
                .block_by_height(height)?
                .ok_or(ChainError::BlockNotFound)?;
            let parent = chain
                .block_by_height(height - 1)?
                .ok_or(ChainError::NilPreviousBlock)?;

            if current.hash != current.compute_hash() {
                return Err(ChainError::InvalidBlockHash);
            }
            if parent.hash != current.prev() {
                return Err(ChainError::InvalidBlockHash);
            }
            if !self.difficulty_in_range(&current, &parent) {
                return Err(ChainError::InvalidDifficulty);
            }
        }

        Ok(())
    }

    fn verify_consensus_proof(&self, block: &Block, parent: &Block) -> ChainResult<()> {
        let proof = &block.header.consensus_proof;
        if proof.len() != PROOF_LEN {
            return Err(ChainError::InvalidConsensusProof);
        }

        let chain_id = bytes_to_u64(&proof[..8]);
        let proof_height = bytes_to_u64(&proof[8..16]);
        let epoch = bytes_to_u64(&proof[16..24]);
        let validator_count = bytes_to_u64(&proof[24..32]);
        let protocol_hash = Hash::from_slice(&proof[32..]);

        if proof_height != parent.height() + 1 {
            return Err(ChainError::InvalidBlockHeight);
        }
        if chain_id != self.chain_id {
            return Err(ChainError::InvalidChainId);
        }
        if validator_count != self.validators.len() as u64 {
            return Err(ChainError::InvalidValidatorCount);
        }
        if epoch != self.epoch {
            return Err(ChainError::InvalidEpoch);
        }
        if protocol_hash != self.protocol_hash {
            return Err(ChainError::InvalidProtocolHash);
        }

        Ok(())
    }

    fn verify_validator_proof(&self, block: &Block) -> ChainResult<()> {
        let proof = &block.header.validator_proof;
        if proof.len() != PROOF_LEN {
            return Err(ChainError::InvalidValidatorProof);
        }

        let chain_id = bytes_to_u64(&proof[..8]);
        let epoch = bytes_to_u64(&proof[8..16]);
        let validator = Address::from_slice(&proof[16..31]);
        let protocol_hash = Hash::from_slice(&proof[32..]);

        if chain_id != self.chain_id
            || epoch != self.epoch
            || protocol_hash != self.protocol_hash
            || validator != block.validator()
        {
            return Err(ChainError::InvalidValidatorProof);
        }

        Ok(())
    }

    /// Recomputes the working difficulty for `block` against its parent and
    /// stores it. Genesis keeps the configured value.
    pub fn adjust_difficulty(&self, block: &Block, parent: &Block) -> u64 {
        if block.height() == 0 {
            return self.difficulty();
        }

        let bounded = self
            .calc_difficulty(block, parent)
            .clamp(MIN_DIFFICULTY, MAX_DIFFICULTY);
        self.state.write().difficulty = bounded;
        bounded
    }

    /// Accepts a block whose difficulty lies within ±10% of the local
    /// expectation. Genesis always passes.
    pub fn difficulty_in_range(&self, block: &Block, parent: &Block) -> bool {
        if block.height() == 0 {
            return true;
        }

        let expected = self.calc_difficulty(block, parent) as f64;
        let min = (expected * (1.0 - DIFFICULTY_DRIFT_MARGIN)) as u64;
        let max = (expected * (1.0 + DIFFICULTY_DRIFT_MARGIN)) as u64;
        block.header.difficulty >= min && block.header.difficulty <= max
    }

    fn calc_difficulty(&self, block: &Block, parent: &Block) -> u64 {
        let prev_difficulty = parent.header.difficulty;
        if block.height() == 0 {
            return prev_difficulty;
        }

        let gas_used = block.header.gas_used;
        let gas_ratio = if gas_used == 0 {
            1.0
        } else {
            block.header.gas_target as f64 / gas_used as f64
        };

        let time_delta = block
            .header
            .timestamp
            .saturating_sub(parent.header.timestamp)
            .max(1);
        let time_factor = self.delay as f64 / time_delta as f64;

        let adjustment = (0.7 * time_factor + 0.3 * gas_ratio).clamp(0.8, 1.2);

        let new_difficulty = prev_difficulty as f64 * adjustment;
        if new_difficulty >= MAX_DIFFICULTY as f64 {
            MAX_DIFFICULTY
        } else if new_difficulty < MIN_DIFFICULTY as f64 {
            MIN_DIFFICULTY
        } else {
            new_difficulty.round() as u64
        }
    }
}
