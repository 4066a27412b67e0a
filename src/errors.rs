use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("transaction rejected: {0}")]
    Transaction(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("block not found")]
    BlockNotFound,
    #[error("block already exists")]
    BlockExists,
    #[error("invalid block height")]
    InvalidBlockHeight,
    #[error("invalid block hash")]
    InvalidBlockHash,
    #[error("duplicated block")]
    DuplicatedBlock,
    #[error("invalid consensus proof")]
    InvalidConsensusProof,
    #[error("invalid validator proof")]
    InvalidValidatorProof,
    #[error("invalid protocol hash")]
    InvalidProtocolHash,
    #[error("invalid chain id")]
    InvalidChainId,
    #[error("invalid epoch")]
    InvalidEpoch,
    #[error("invalid validator")]
    InvalidValidator,
    #[error("invalid validator count")]
    InvalidValidatorCount,
    #[error("invalid difficulty")]
    InvalidDifficulty,
    #[error("invalid seal hash")]
    InvalidSealHash,
    #[error("invalid block size")]
    InvalidBlockSize,
    #[error("invalid block timestamp")]
    InvalidBlockTimestamp,
    #[error("invalid block nonce")]
    InvalidBlockNonce,
    #[error("block is not initialized")]
    NilBlock,
    #[error("previous block is missing")]
    NilPreviousBlock,
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
}

pub type ChainResult<T> = Result<T, ChainError>;
