use std::path::Path;
use std::sync::Arc;

use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::ChainResult;
use crate::types::{Block, BlockHeader, Hash, Transaction};

/// Table names. Tables are realized as key prefixes separated from the row
/// key by a NUL byte, which keeps scoped tables (`blocks/hash/%s/…`) from
/// shadowing their parents during prefix scans.
pub mod tables {
    pub const BLOCKS_BY_HASH: &str = "blocks/hash/";
    pub const BLOCKS_BY_HEIGHT: &str = "blocks/height/";
    pub const BLOCKS_LATEST: &str = "blocks/latest/";
    pub const TRANSACTIONS_CONFIRMED: &str = "transactions/confirmed/";
    pub const TRANSACTIONS_REJECTED: &str = "transactions/rejected/";
    pub const BLOCK_POOL: &str = "blockpool/";

    pub fn transactions_by_account(account_cxid: &str) -> String {
        format!("accounts/{account_cxid}/transactions/")
    }

    pub fn transactions_by_block_hash(block_cxid: &str) -> String {
        format!("blocks/hash/{block_cxid}/transactions/")
    }

    pub fn transactions_by_block_height(height: u64) -> String {
        format!("blocks/height/{height}/transactions/")
    }

    pub fn txpool_at_height(height: u64) -> String {
        format!("txpool/block_{height}")
    }
}

const TABLE_REGISTRY: &str = "tables/";
const LATEST_KEY: &str = "latest";

/// Persisted block row. Transactions live in their own scoped tables and are
/// re-hydrated on read.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredBlock {
    pub header: BlockHeader,
    pub hash: Hash,
    pub seal_hash: Hash,
    pub slot_hash: Hash,
    pub transactions: u64,
}

impl StoredBlock {
    pub fn from_block(block: &Block) -> Self {
        Self {
            header: block.header.clone(),
            hash: block.hash,
            seal_hash: block.seal_hash,
            slot_hash: block.slot_hash,
            transactions: block.transactions.len() as u64,
        }
    }

    pub fn into_block(self, transactions: Vec<Transaction>) -> Block {
        Block {
            header: self.header,
            transactions,
            hash: self.hash,
            seal_hash: self.seal_hash,
            slot_hash: self.slot_hash,
        }
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }
}

pub struct Storage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

fn compose_key(table: &str, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(table.len() + 1 + key.len());
    out.extend_from_slice(table.as_bytes());
    out.push(0);
    out.extend_from_slice(key.as_bytes());
    out
}

impl Storage {
    pub fn open(path: &Path) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path)?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn create(&self, table: &str) -> ChainResult<()> {
        self.db.put(compose_key(TABLE_REGISTRY, table), [1u8])?;
        Ok(())
    }

    pub fn exist(&self, table: &str) -> ChainResult<bool> {
        Ok(self.db.get(compose_key(TABLE_REGISTRY, table))?.is_some())
    }

    pub fn write<T: Serialize>(&self, table: &str, key: &str, value: &T) -> ChainResult<()> {
        let data = bincode::serialize(value)?;
        self.db.put(compose_key(table, key), data)?;
        Ok(())
    }

    pub fn read<T: DeserializeOwned>(&self, table: &str, key: &str) -> ChainResult<Option<T>> {
        match self.db.get(compose_key(table, key))? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Reads every row of a table in key order.
    pub fn read_batch<T: DeserializeOwned>(&self, table: &str) -> ChainResult<Vec<(String, T)>> {
        let prefix = compose_key(table, "");
        let mut rows = Vec::new();
        let iterator = self
            .db
            .iterator(IteratorMode::From(&prefix, Direction::Forward));
        for entry in iterator {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            let row_key = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            rows.push((row_key, bincode::deserialize(&value)?));
        }
        Ok(rows)
    }

    pub fn count(&self, table: &str) -> ChainResult<u64> {
        let prefix = compose_key(table, "");
        let mut count = 0;
        let iterator = self
            .db
            .iterator(IteratorMode::From(&prefix, Direction::Forward));
        for entry in iterator {
            let (key, _) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    pub fn init_tables(&self) -> ChainResult<()> {
        for table in [
            tables::BLOCKS_BY_HASH,
            tables::BLOCKS_BY_HEIGHT,
            tables::BLOCKS_LATEST,
            tables::TRANSACTIONS_CONFIRMED,
            tables::TRANSACTIONS_REJECTED,
            tables::BLOCK_POOL,
        ] {
            if !self.exist(table)? {
                self.create(table)?;
            }
        }
        Ok(())
    }

    /// Persists a block under its hash, its height, and the latest slot,
    /// fanning its transactions out to the confirmed and scoped tables.
    pub fn commit_block(&self, block: &Block) -> ChainResult<()> {
        let record = StoredBlock::from_block(block);
        let block_cxid = block.hash.to_cxid();
        let height_key = block.height().to_string();

        self.write(tables::BLOCKS_BY_HASH, &block_cxid, &record)?;
        self.write(tables::BLOCKS_BY_HEIGHT, &height_key, &record)?;
        self.write(tables::BLOCKS_LATEST, LATEST_KEY, &record)?;

        let by_block_hash = tables::transactions_by_block_hash(&block_cxid);
        let by_block_height = tables::transactions_by_block_height(block.height());
        for tx in &block.transactions {
            let tx_cxid = tx.hash.to_cxid();
            self.write(tables::TRANSACTIONS_CONFIRMED, &tx_cxid, tx)?;
            self.write(&by_block_hash, &tx_cxid, tx)?;
            self.write(&by_block_height, &tx_cxid, tx)?;
            self.write(
                &tables::transactions_by_account(&tx.data.from.to_cxid()),
                &tx_cxid,
                tx,
            )?;
            self.write(
                &tables::transactions_by_account(&tx.data.to.to_cxid()),
                &tx_cxid,
                tx,
            )?;
        }

        Ok(())
    }

    pub fn block_by_hash(&self, hash: &Hash) -> ChainResult<Option<Block>> {
        let record: Option<StoredBlock> = self.read(tables::BLOCKS_BY_HASH, &hash.to_cxid())?;
        self.hydrate(record)
    }

    pub fn block_by_height(&self, height: u64) -> ChainResult<Option<Block>> {
        let record: Option<StoredBlock> =
            self.read(tables::BLOCKS_BY_HEIGHT, &height.to_string())?;
        self.hydrate(record)
    }

    pub fn latest_block(&self) -> ChainResult<Option<Block>> {
        let record: Option<StoredBlock> = self.read(tables::BLOCKS_LATEST, LATEST_KEY)?;
        self.hydrate(record)
    }

    pub fn has_block(&self, hash: &Hash) -> ChainResult<bool> {
        Ok(self
            .read::<StoredBlock>(tables::BLOCKS_BY_HASH, &hash.to_cxid())?
            .is_some())
    }

    pub fn transactions_by_height(&self, height: u64) -> ChainResult<Vec<Transaction>> {
        let rows: Vec<(String, Transaction)> =
            self.read_batch(&tables::transactions_by_block_height(height))?;
        Ok(rows.into_iter().map(|(_, tx)| tx).collect())
    }

    pub fn record_rejected(&self, tx: &Transaction) -> ChainResult<()> {
        self.write(tables::TRANSACTIONS_REJECTED, &tx.hash.to_cxid(), tx)
    }

    fn hydrate(&self, record: Option<StoredBlock>) -> ChainResult<Option<Block>> {
        let Some(record) = record else {
            return Ok(None);
        };
        let transactions = self.transactions_by_height(record.height())?;
        Ok(Some(record.into_block(transactions)))
    }
}
