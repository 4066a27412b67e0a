//! Permissioned proof-of-authority blockchain node.
//!
//! The crate composes an append-only ledger of signed, sealed blocks with an
//! encrypted peer-to-peer gossip overlay. `consensus` carries the engine that
//! frames, seals, and verifies blocks; `chain` owns the head pointer and the
//! ticker loops that commit elected proposals; `txpool` and `blockpool` stage
//! transactions and block candidates; `miner` produces proposals on the
//! configured cadence; and `p2p` exchanges head hashes and full blocks with
//! authenticated peers. `storage` persists everything through a
//! table-oriented key-value contract.
//!
//! Applications typically load a [`config::NodeConfig`], open a
//! [`storage::Storage`], and wire an [`consensus::Engine`] into a
//! [`chain::Blockchain`], a [`miner::Worker`], and a [`p2p::Node`].

pub mod blockpool;
pub mod chain;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod errors;
pub mod gas;
pub mod miner;
pub mod p2p;
pub mod storage;
pub mod txpool;
pub mod types;
