use serde::{Deserialize, Serialize};

use crate::crypto::{digest256, verify_digest, Keypair};
use crate::errors::ChainResult;
use crate::types::{Address, Hash, Transaction};

use k256::ecdsa::VerifyingKey;

/// Fixed header footprint: nine u64 fields, the parent hash, and the
/// validator address.
const HEADER_FIXED_SIZE: u64 = 9 * 8 + 32 + 15;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
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
    pub size: u64,
}

/// Hashing view: every header field except `signature` and `size`, so the
/// block hash is stable across signing and size bookkeeping.
#[derive(Serialize)]
struct HashView<'a> {
    height: u64,
    prev: &'a Hash,
    timestamp: u64,
    nonce: u64,
    gas_target: u64,
    gas_tip: u64,
    gas_used: u64,
    difficulty: u64,
    total_difficulty: u64,
    data: &'a [u8],
    validator_proof: &'a [u8],
    consensus_proof: &'a [u8],
    validator: &'a Address,
}

impl BlockHeader {
    fn hash_view(&self) -> HashView<'_> {
        HashView {
            height: self.height,
            prev: &self.prev,
            timestamp: self.timestamp,
            nonce: self.nonce,
            gas_target: self.gas_target,
            gas_tip: self.gas_tip,
            gas_used: self.gas_used,
            difficulty: self.difficulty,
            total_difficulty: self.total_difficulty,
            data: &self.data,
            validator_proof: &self.validator_proof,
            consensus_proof: &self.consensus_proof,
            validator: &self.validator,
        }
    }

    pub fn hashing_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.hash_view()).expect("serializing block header")
    }

    pub fn hash(&self) -> Hash {
        digest256(&self.hashing_bytes())
    }

    pub fn calculate_size(&self) -> u64 {
        HEADER_FIXED_SIZE
            + self.data.len() as u64
            + self.validator_proof.len() as u64
            + self.consensus_proof.len() as u64
            + self.signature.len() as u64
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub hash: Hash,
    pub seal_hash: Hash,
    pub slot_hash: Hash,
}

impl Block {
    pub fn new(mut header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        header.size = header.calculate_size();
        let mut block = Self {
            header,
            transactions,
            hash: Hash::default(),
            seal_hash: Hash::default(),
            slot_hash: Hash::default(),
        };
        block.refresh_hash();
        block
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn prev(&self) -> Hash {
        self.header.prev
    }

    pub fn validator(&self) -> Address {
        self.header.validator
    }

    pub fn compute_hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn refresh_hash(&mut self) {
        self.hash = self.compute_hash();
    }

    /// At-most-once membership by transaction hash.
    pub fn add_transaction(&mut self, tx: Transaction) {
        if self.transactions.iter().any(|t| t.hash == tx.hash) {
            return;
        }
        self.transactions.push(tx);
    }

    /// Signs the hashing view and refreshes the size bookkeeping; the block
    /// hash itself is unaffected because the view excludes both fields.
    pub fn sign(&mut self, keypair: &Keypair) -> ChainResult<()> {
        let digest = self.header.hash();
        self.header.signature = keypair.sign_digest(&digest)?.to_vec();
        self.header.size = self.header.calculate_size();
        Ok(())
    }

    pub fn verify_signature(&self, public_key: &VerifyingKey) -> ChainResult<()> {
        verify_digest(public_key, &self.header.hash(), &self.header.signature)
    }

    pub fn seal(&mut self, seal: Hash) {
        self.seal_hash = seal;
    }

    pub fn set_slot_hash(&mut self, slot: Hash) {
        self.slot_hash = slot;
    }
}
