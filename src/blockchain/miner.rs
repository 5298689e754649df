use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::{DifficultyPolicy, LedgerConfig};

use super::block::Block;
use super::chain::{Chain, ChainError};
use super::crypto::Address;
use super::hashing::{block_hash, canonical_now, meets_difficulty, PayloadFields, TransactionFields, MAX_DIFFICULTY};
use super::ledger::{balances, LedgerError};
use super::pool::TransactionPool;
use super::transaction::Transaction;

/// Attempts between progress log lines
const PROGRESS_INTERVAL: u64 = 1 << 20;

/// Errors that can end a mining round
#[derive(Debug, Error)]
pub enum MinerError {
    #[error("Mining cancelled after {attempts} attempts")]
    Cancelled { attempts: u64 },

    /// No pending transfer can be paid and empty blocks are disabled
    ///
    /// `overdrawn` lists the pending transfers that were skipped as unpayable;
    /// the caller is expected to prune them.
    #[error("No payable transactions pending and empty blocks are disabled")]
    EmptyPool { overdrawn: Vec<String> },

    #[error("Invalid difficulty {0}: must be at most 64")]
    InvalidDifficulty(u8),

    #[error("Nonce space exhausted")]
    NonceSpaceExhausted,

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Shared stop switch for a proof-of-work search
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag(Arc::new(AtomicBool::new(false)))
    }

    /// Asks every search holding this flag to stop
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What the miner is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerState {
    Idle,
    Searching,
}

/// A block ready for the nonce search, plus pool entries found unpayable
#[derive(Debug, Clone)]
pub struct Candidate {
    pub block: Block,

    /// Hashes of pending transfers whose senders cannot cover them
    pub overdrawn: Vec<String>,
}

/// Varies the nonce from 0 until the block hash meets its difficulty
///
/// The flag is checked before every attempt. A cancelled search returns an
/// error and leaves nothing modified.
pub fn search(mut candidate: Block, cancel: &CancelFlag) -> Result<Block, MinerError> {
    if candidate.difficulty > MAX_DIFFICULTY {
        return Err(MinerError::InvalidDifficulty(candidate.difficulty));
    }

    let (nonce, hash) = {
        let fields: Vec<TransactionFields<'_>> =
            candidate.transactions.iter().map(Transaction::fields).collect();
        let payload = PayloadFields {
            transactions: &fields,
            reward: candidate.reward,
            miner: &candidate.miner,
        };

        let mut nonce: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                info!("Mining of block {} cancelled after {} attempts", candidate.index, nonce);
                return Err(MinerError::Cancelled { attempts: nonce });
            }

            let hash = block_hash(
                candidate.index,
                candidate.timestamp,
                &payload,
                &candidate.previous_hash,
                nonce,
            );
            if meets_difficulty(&hash, candidate.difficulty) {
                break (nonce, hash);
            }

            if nonce % PROGRESS_INTERVAL == 0 && nonce > 0 {
                debug!("Block {}: {} attempts so far", candidate.index, nonce);
            }
            nonce = nonce.checked_add(1).ok_or(MinerError::NonceSpaceExhausted)?;
        }
    };

    info!(
        "Found nonce {} for block {} after {} attempts: {}",
        nonce,
        candidate.index,
        nonce + 1,
        hash
    );
    candidate.nonce = nonce;
    candidate.hash = hash;
    Ok(candidate)
}

/// Difficulty for the next candidate block, derived only from chain history
pub fn next_difficulty(policy: &DifficultyPolicy, chain: &Chain) -> u8 {
    match *policy {
        DifficultyPolicy::Fixed(difficulty) => difficulty,
        DifficultyPolicy::Retarget {
            target_block_secs,
            window,
            min,
            max,
        } => {
            let base = chain.tip().difficulty.max(min).min(max);
            let blocks = chain.blocks();

            // Genesis carries a fixed timestamp, so spacing is measured from block 1.
            let start = blocks.len().saturating_sub(window.max(1) + 1).max(1);
            let recent = match blocks.get(start..) {
                Some(recent) if recent.len() >= 2 => recent,
                _ => return base,
            };

            let span = recent[recent.len() - 1].timestamp - recent[0].timestamp;
            let average = span.num_seconds() / (recent.len() as i64 - 1);

            if average < target_block_secs / 2 {
                base.saturating_add(1).min(max)
            } else if average > target_block_secs.saturating_mul(2) {
                base.saturating_sub(1).max(min)
            } else {
                base
            }
        }
    }
}

/// Builds candidate blocks, searches for nonces and commits the results
#[derive(Debug)]
pub struct Miner {
    block_reward: f64,
    max_block_transactions: usize,
    allow_empty_blocks: bool,
    searching: AtomicBool,
}

impl Miner {
    pub fn new(config: &LedgerConfig) -> Self {
        Miner {
            block_reward: config.block_reward,
            max_block_transactions: config.max_block_transactions,
            allow_empty_blocks: config.allow_empty_blocks,
            searching: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> MinerState {
        if self.searching.load(Ordering::Relaxed) {
            MinerState::Searching
        } else {
            MinerState::Idle
        }
    }

    /// Assembles the next candidate block on top of the chain tip
    ///
    /// Pending transfers that would overdraw their sender, given the chain
    /// balances and earlier transfers in the same candidate, are left out and
    /// reported in `overdrawn`.
    pub fn prepare(
        &self,
        chain: &Chain,
        pool: &TransactionPool,
        miner: &Address,
        difficulty: u8,
    ) -> Result<Candidate, MinerError> {
        if difficulty > MAX_DIFFICULTY {
            return Err(MinerError::InvalidDifficulty(difficulty));
        }
        let mut available: HashMap<Address, f64> = balances(chain)?.into_iter().collect();
        let mut transactions = Vec::new();
        let mut overdrawn = Vec::new();

        for tx in pool.select_for_mining(self.max_block_transactions) {
            let Some(sender) = tx.sender() else { continue };
            let funds = available.entry(sender.clone()).or_default();

            if *funds + 1e-9 < tx.amount() {
                warn!(
                    "Dropping transaction {}: sender {} has {} but sends {}",
                    tx.hash(),
                    sender,
                    funds,
                    tx.amount()
                );
                overdrawn.push(tx.hash().to_string());
                continue;
            }

            *funds -= tx.amount();
            transactions.push(tx);
        }

        if transactions.is_empty() && !self.allow_empty_blocks {
            return Err(MinerError::EmptyPool { overdrawn });
        }

        let timestamp = canonical_now();
        transactions.push(Transaction::reward(miner.clone(), self.block_reward, timestamp));

        let tip = chain.tip();
        let block = Block::new(
            tip.index + 1,
            timestamp,
            transactions,
            self.block_reward,
            miner.clone(),
            tip.hash.clone(),
            difficulty,
        );

        Ok(Candidate { block, overdrawn })
    }

    /// Runs the nonce search, tracking the miner state
    pub fn search(&self, candidate: Block, cancel: &CancelFlag) -> Result<Block, MinerError> {
        self.searching.store(true, Ordering::Relaxed);
        let result = search(candidate, cancel);
        self.searching.store(false, Ordering::Relaxed);
        result
    }

    /// Appends a mined block and prunes its transactions from the pool
    pub fn commit(
        &self,
        chain: &mut Chain,
        pool: &mut TransactionPool,
        block: Block,
        overdrawn: &[String],
    ) -> Result<Block, MinerError> {
        chain.append(block.clone())?;

        let mined = pool.remove(block.transfers().map(Transaction::hash));
        let dropped = self.discard(pool, overdrawn);
        debug!(
            "Pruned {} mined and {} unpayable transactions from the pool",
            mined, dropped
        );

        Ok(block)
    }

    /// Drops transfers found unpayable during candidate assembly
    pub fn discard(&self, pool: &mut TransactionPool, overdrawn: &[String]) -> usize {
        pool.remove(overdrawn.iter().map(String::as_str))
    }

    /// Prepare, search and commit in one step against exclusively borrowed state
    pub fn mine(
        &self,
        chain: &mut Chain,
        pool: &mut TransactionPool,
        miner: &Address,
        difficulty: u8,
        cancel: &CancelFlag,
    ) -> Result<Block, MinerError> {
        let Candidate { block, overdrawn } = match self.prepare(chain, pool, miner, difficulty) {
            Ok(candidate) => candidate,
            Err(MinerError::EmptyPool { overdrawn }) => {
                self.discard(pool, &overdrawn);
                return Err(MinerError::EmptyPool { overdrawn });
            }
            Err(err) => return Err(err),
        };
        let block = self.search(block, cancel)?;
        self.commit(chain, pool, block, &overdrawn)
    }
}
