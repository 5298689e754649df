// Blockchain module
//
// This module contains the ledger engine:
// - Canonical hashing and Ed25519 signing
// - Transaction and block structures
// - Chain construction and validation
// - Transaction pool admission
// - Proof of work mining
// - Balance and history replay
// - Persistence through an injected store

pub mod block;
pub mod chain;
pub mod crypto;
pub mod hashing;
pub mod ledger;
pub mod miner;
pub mod pool;
pub mod service;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Chain, ChainError};
pub use crypto::{Address, DigitalSignature, PublicKey, Wallet};
pub use ledger::{Direction, HistoryEntry, LedgerError};
pub use miner::{CancelFlag, Miner, MinerError, MinerState};
pub use pool::{PoolError, TransactionPool};
pub use service::{Blockchain, BlockchainError};
pub use storage::{ChainStore, MemoryStore, SledStore, Snapshot, StorageError};
pub use transaction::{Reward, Transaction, TransactionError, Transfer};
