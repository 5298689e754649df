use std::collections::{HashMap, HashSet};

use log::{debug, info};
use thiserror::Error;

use crate::config::{GenesisConfig, LedgerConfig};

use super::block::Block;
use super::hashing::{GENESIS_PREVIOUS_HASH, MAX_DIFFICULTY};
use super::transaction::Transaction;

/// Errors that can occur during chain operations
///
/// Integrity variants carry the index of the offending block so callers can
/// report exactly where a chain stops following its own rules.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChainError {
    #[error("Block {index}: previous hash {actual} does not match predecessor hash {expected}")]
    Linkage {
        index: u64,
        expected: String,
        actual: String,
    },

    #[error("Block {index}: hash {hash} does not satisfy difficulty {difficulty}")]
    ProofOfWork { index: u64, hash: String, difficulty: u8 },

    #[error("Block {index}: stored hash {actual} does not match recomputed hash {expected}")]
    HashMismatch {
        index: u64,
        expected: String,
        actual: String,
    },

    #[error("Block {index} is invalid: {reason}")]
    InvalidBlock { index: u64, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ChainError {
    /// Index of the block that failed, for integrity errors
    pub fn block_index(&self) -> Option<u64> {
        match self {
            ChainError::Linkage { index, .. }
            | ChainError::ProofOfWork { index, .. }
            | ChainError::HashMismatch { index, .. }
            | ChainError::InvalidBlock { index, .. } => Some(*index),
            ChainError::NotFound(_) => None,
        }
    }
}

/// Builds the fixed first block
///
/// Genesis has no transactions; its reward is credited to the configured
/// genesis address through the block fields alone.
pub fn genesis(genesis: &GenesisConfig, reward: f64) -> Block {
    Block::new(
        0,
        genesis.timestamp,
        Vec::new(),
        reward,
        genesis.miner.clone(),
        GENESIS_PREVIOUS_HASH.to_string(),
        genesis.difficulty,
    )
}

/// The ordered, append-only sequence of blocks
#[derive(Debug, Clone)]
pub struct Chain {
    blocks: Vec<Block>,

    /// Block hash -> height
    block_index: HashMap<String, u64>,

    /// Transaction hash -> height of the block including it
    tx_index: HashMap<String, u64>,

    /// Reward every non-genesis block must pay its miner
    block_reward: f64,
}

impl Chain {
    /// Creates a chain holding only the genesis block
    pub fn new(config: &LedgerConfig) -> Self {
        let genesis = genesis(&config.genesis, config.block_reward);
        info!("Created genesis block {}", genesis.hash);

        let mut chain = Chain {
            blocks: Vec::new(),
            block_index: HashMap::new(),
            tx_index: HashMap::new(),
            block_reward: config.block_reward,
        };
        chain.push(genesis);
        chain
    }

    /// Rebuilds a chain from stored blocks, recomputing every hash
    pub fn from_blocks(config: &LedgerConfig, blocks: Vec<Block>) -> Result<Self, ChainError> {
        let expected_genesis = genesis(&config.genesis, config.block_reward);
        let mut iter = blocks.into_iter();

        let first = iter.next().ok_or_else(|| ChainError::InvalidBlock {
            index: 0,
            reason: "chain has no genesis block".to_string(),
        })?;
        check_genesis(&first, &expected_genesis)?;

        let mut chain = Chain {
            blocks: Vec::new(),
            block_index: HashMap::new(),
            tx_index: HashMap::new(),
            block_reward: config.block_reward,
        };
        chain.push(first);

        for block in iter {
            chain.append(block)?;
        }

        debug!("Rebuilt chain of {} blocks", chain.len());
        Ok(chain)
    }

    /// The newest block
    pub fn tip(&self) -> &Block {
        // A chain is never empty: construction always pushes genesis.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Appends a mined block on top of the tip
    ///
    /// Nothing is modified unless every check passes.
    pub fn append(&mut self, block: Block) -> Result<(), ChainError> {
        let position = self.blocks.len() as u64;
        check_successor(&block, self.tip(), position, self.block_reward)?;
        self.check_not_replayed(&block, position)?;

        info!(
            "Appended block {} with {} transactions ({})",
            block.index,
            block.transactions.len(),
            block.hash
        );
        self.push(block);
        Ok(())
    }

    /// Re-derives every block hash and re-checks linkage and proof of work
    ///
    /// Returns the first violation found, walking from genesis to the tip.
    pub fn validate(&self) -> Result<(), ChainError> {
        let first = self.blocks.first().ok_or_else(|| ChainError::InvalidBlock {
            index: 0,
            reason: "chain has no genesis block".to_string(),
        })?;
        check_genesis_shape(first)?;

        let mut seen: HashSet<&str> = HashSet::new();
        for (offset, pair) in self.blocks.windows(2).enumerate() {
            let (previous, block) = (&pair[0], &pair[1]);
            let position = offset as u64 + 1;
            check_successor(block, previous, position, self.block_reward)?;

            for tx in block.transfers() {
                if !seen.insert(tx.hash()) {
                    return Err(ChainError::InvalidBlock {
                        index: position,
                        reason: format!("transaction {} was already included earlier", tx.hash()),
                    });
                }
            }
        }

        Ok(())
    }

    /// Looks up a block by height
    pub fn block_at(&self, height: u64) -> Result<&Block, ChainError> {
        usize::try_from(height)
            .ok()
            .and_then(|height| self.blocks.get(height))
            .ok_or_else(|| ChainError::NotFound(format!("no block at height {}", height)))
    }

    /// Looks up a block by its hash
    pub fn block_by_hash(&self, hash: &str) -> Result<&Block, ChainError> {
        self.block_index
            .get(hash)
            .and_then(|height| self.blocks.get(*height as usize))
            .ok_or_else(|| ChainError::NotFound(format!("no block with hash {}", hash)))
    }

    /// Finds a mined transaction and the block containing it
    pub fn transaction_by_hash(&self, hash: &str) -> Result<(&Block, &Transaction), ChainError> {
        self.tx_index
            .get(hash)
            .and_then(|height| self.blocks.get(*height as usize))
            .and_then(|block| {
                block
                    .transactions
                    .iter()
                    .find(|tx| tx.hash() == hash)
                    .map(|tx| (block, tx))
            })
            .ok_or_else(|| ChainError::NotFound(format!("no transaction with hash {}", hash)))
    }

    /// Whether a transaction is already part of the chain
    pub fn contains_transaction(&self, hash: &str) -> bool {
        self.tx_index.contains_key(hash)
    }

    fn check_not_replayed(&self, block: &Block, position: u64) -> Result<(), ChainError> {
        for tx in block.transfers() {
            if let Some(height) = self.tx_index.get(tx.hash()) {
                return Err(ChainError::InvalidBlock {
                    index: position,
                    reason: format!("transaction {} already included in block {}", tx.hash(), height),
                });
            }
        }
        Ok(())
    }

    fn push(&mut self, block: Block) {
        self.block_index.insert(block.hash.clone(), block.index);
        for tx in &block.transactions {
            self.tx_index.insert(tx.hash().to_string(), block.index);
        }
        self.blocks.push(block);
    }
}

fn check_genesis(block: &Block, expected: &Block) -> Result<(), ChainError> {
    check_genesis_shape(block)?;

    if block != expected {
        return Err(ChainError::InvalidBlock {
            index: 0,
            reason: format!("genesis {} differs from configured genesis {}", block.hash, expected.hash),
        });
    }
    Ok(())
}

fn check_genesis_shape(block: &Block) -> Result<(), ChainError> {
    if block.index != 0 || !block.transactions.is_empty() {
        return Err(ChainError::InvalidBlock {
            index: 0,
            reason: "genesis must be block 0 with no transactions".to_string(),
        });
    }

    if block.previous_hash != GENESIS_PREVIOUS_HASH {
        return Err(ChainError::Linkage {
            index: 0,
            expected: GENESIS_PREVIOUS_HASH.to_string(),
            actual: block.previous_hash.clone(),
        });
    }

    check_hash(block, 0)?;
    check_proof_of_work(block, 0)
}

/// Checks everything about `block` that follows from its predecessor and itself
///
/// Errors report `position`, the height the block occupies in the chain, never
/// the index the block claims for itself.
fn check_successor(block: &Block, previous: &Block, position: u64, block_reward: f64) -> Result<(), ChainError> {
    if block.previous_hash != previous.hash {
        return Err(ChainError::Linkage {
            index: position,
            expected: previous.hash.clone(),
            actual: block.previous_hash.clone(),
        });
    }

    if block.index != position {
        return Err(ChainError::InvalidBlock {
            index: position,
            reason: format!("recorded index {}, expected {}", block.index, position),
        });
    }

    check_hash(block, position)?;
    check_proof_of_work(block, position)?;
    check_contents(block, position, block_reward)
}

fn check_hash(block: &Block, position: u64) -> Result<(), ChainError> {
    let expected = block.calculate_hash();
    if expected != block.hash {
        return Err(ChainError::HashMismatch {
            index: position,
            expected,
            actual: block.hash.clone(),
        });
    }
    Ok(())
}

fn check_proof_of_work(block: &Block, position: u64) -> Result<(), ChainError> {
    if block.difficulty > MAX_DIFFICULTY {
        return Err(ChainError::InvalidBlock {
            index: position,
            reason: format!("difficulty {} exceeds {}", block.difficulty, MAX_DIFFICULTY),
        });
    }

    if !block.meets_difficulty() {
        return Err(ChainError::ProofOfWork {
            index: position,
            hash: block.hash.clone(),
            difficulty: block.difficulty,
        });
    }
    Ok(())
}

/// The configured reward paid once to the miner, verified transfers, no duplicates
fn check_contents(block: &Block, position: u64, block_reward: f64) -> Result<(), ChainError> {
    let invalid = |reason: String| ChainError::InvalidBlock {
        index: position,
        reason,
    };

    if block.reward != block_reward {
        return Err(invalid(format!(
            "block reward {} differs from the configured reward {}",
            block.reward, block_reward
        )));
    }

    let rewards: Vec<&Transaction> = block.transactions.iter().filter(|tx| tx.is_reward()).collect();
    let reward = match rewards.as_slice() {
        [reward] => *reward,
        _ => return Err(invalid(format!("expected one reward transaction, found {}", rewards.len()))),
    };

    if reward.recipient() != &block.miner || reward.amount() != block.reward {
        return Err(invalid(format!(
            "reward transaction pays {} to {}, block records {} to {}",
            reward.amount(),
            reward.recipient(),
            block.reward,
            block.miner
        )));
    }

    let mut seen = HashSet::new();
    for tx in &block.transactions {
        if !seen.insert(tx.hash()) {
            return Err(invalid(format!("duplicate transaction {}", tx.hash())));
        }

        tx.verify()
            .map_err(|err| invalid(format!("transaction {}: {}", tx.hash(), err)))?;
    }

    Ok(())
}
