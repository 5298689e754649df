use std::path::Path;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use thiserror::Error;

use super::block::Block;
use super::transaction::Transaction;

const TIP_HASH_KEY: &str = "tip_hash";
const HEIGHT_KEY: &str = "block_height";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Corrupt store: {0}")]
    Corrupt(String),
}

/// Everything a store persists: the chain and the pending pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub blocks: Vec<Block>,

    /// Pending transactions in arrival order
    pub pending: Vec<Transaction>,
}

/// Persistence collaborator injected into the ledger
///
/// The store only moves bytes. Whoever loads a snapshot is expected to
/// rebuild and revalidate the chain from it.
pub trait ChainStore: Send + Sync {
    /// Returns `None` when nothing has been saved yet
    fn load(&self) -> Result<Option<Snapshot>, StorageError>;

    fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError>;
}

/// Sled-backed store: one tree for blocks keyed by height, one for the pool
pub struct SledStore {
    /// The database instance
    db: Db,

    /// Height (big-endian u64) -> bincode block
    blocks: Tree,

    /// Arrival position (big-endian u64) -> bincode transaction
    pending: Tree,

    /// Tip hash and height
    metadata: Tree,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("blocks", &self.blocks.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl SledStore {
    /// Opens (or creates) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree("blocks")?;
        let pending = db.open_tree("pending")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            pending,
            metadata,
        })
    }

    /// Gets a block by height
    pub fn get_block(&self, height: u64) -> Result<Option<Block>, StorageError> {
        self.blocks
            .get(height.to_be_bytes())?
            .map(|value| decode(&value))
            .transpose()
    }

    /// Gets the stored tip hash
    pub fn get_tip_hash(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .metadata
            .get(TIP_HASH_KEY)?
            .map(|value| String::from_utf8_lossy(&value).to_string()))
    }

    /// Gets the stored block height
    pub fn get_block_height(&self) -> Result<Option<u64>, StorageError> {
        self.metadata
            .get(HEIGHT_KEY)?
            .map(|value| decode(&value))
            .transpose()
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl ChainStore for SledStore {
    fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        if self.blocks.is_empty() {
            return Ok(None);
        }

        let mut blocks = Vec::with_capacity(self.blocks.len());
        // Big-endian keys iterate in height order.
        for result in self.blocks.iter() {
            let (key, value) = result?;
            let block: Block = decode(&value)?;

            if &key[..] != &block.index.to_be_bytes()[..] {
                return Err(StorageError::Corrupt(format!(
                    "block {} stored under the wrong key",
                    block.index
                )));
            }
            if block.index != blocks.len() as u64 {
                return Err(StorageError::Corrupt(format!(
                    "missing block at height {}",
                    blocks.len()
                )));
            }
            blocks.push(block);
        }

        let mut pending = Vec::with_capacity(self.pending.len());
        for result in self.pending.iter() {
            let (key, value) = result?;
            match decode::<Transaction>(&value) {
                Ok(tx) => pending.push(tx),
                // A lost pending transaction is recoverable; the client can resubmit it.
                Err(e) => warn!(
                    "Skipping undecodable pending transaction {}: {}",
                    hex::encode(&key),
                    e
                ),
            }
        }

        debug!("Loaded {} blocks and {} pending transactions", blocks.len(), pending.len());
        Ok(Some(Snapshot { blocks, pending }))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        // Blocks are immutable once stored, so only the new ones are written.
        let stored = self.blocks.len();
        for block in snapshot.blocks.iter().skip(stored) {
            self.blocks.insert(block.index.to_be_bytes(), encode(block)?)?;
        }

        self.pending.clear()?;
        for (position, tx) in snapshot.pending.iter().enumerate() {
            self.pending.insert((position as u64).to_be_bytes(), encode(tx)?)?;
        }

        if let Some(tip) = snapshot.blocks.last() {
            self.metadata.insert(TIP_HASH_KEY, tip.hash.as_bytes())?;
            self.metadata.insert(HEIGHT_KEY, encode(&tip.index)?)?;
        }

        self.flush()
    }
}

/// Store kept in process memory, for tests and throwaway nodes
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChainStore for MemoryStore {
    fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.snapshot.lock().clone())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::DeserializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::chain::Chain;
    use crate::blockchain::crypto::Wallet;
    use crate::blockchain::miner::{CancelFlag, Miner};
    use crate::blockchain::pool::TransactionPool;
    use crate::config::LedgerConfig;

    fn snapshot_with_blocks(count: usize) -> (LedgerConfig, Snapshot) {
        let config = LedgerConfig::with_difficulty(1);
        let mut chain = Chain::new(&config);
        let mut pool = TransactionPool::new(10, 60);
        let miner = Miner::new(&config);
        let wallet = Wallet::new();

        for _ in 0..count {
            miner.mine(&mut chain, &mut pool, wallet.address(), 1, &CancelFlag::new()).unwrap();
        }
        pool.admit(Transaction::transfer(&wallet, Wallet::new().address().clone(), 1.0)).unwrap();

        let snapshot = Snapshot {
            blocks: chain.blocks().to_vec(),
            pending: pool.pending().cloned().collect(),
        };
        (config, snapshot)
    }

    #[test]
    fn test_sled_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        assert!(store.load().unwrap().is_none());

        let (config, snapshot) = snapshot_with_blocks(2);
        store.save(&snapshot).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(store.get_block_height().unwrap(), Some(2));
        assert_eq!(store.get_tip_hash().unwrap(), Some(snapshot.blocks[2].hash.clone()));
        assert_eq!(store.get_block(1).unwrap(), Some(snapshot.blocks[1].clone()));

        // Reloaded blocks still hash to their stored values.
        let chain = Chain::from_blocks(&config, loaded.blocks).unwrap();
        assert!(chain.validate().is_ok());
    }

    #[test]
    fn test_sled_store_appends_new_blocks_and_replaces_pool() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        let (_, mut snapshot) = snapshot_with_blocks(1);
        store.save(&snapshot).unwrap();

        snapshot.pending.clear();
        store.save(&snapshot).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.blocks.len(), 2);
        assert!(loaded.pending.is_empty());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());

        let (_, snapshot) = snapshot_with_blocks(1);
        store.save(&snapshot).unwrap();
        assert_eq!(store.load().unwrap(), Some(snapshot));
    }
}
