use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use thiserror::Error;

use super::crypto::Address;
use super::transaction::{Transaction, TransactionError};

/// Errors returned by pool admission
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Duplicate transaction: {0}")]
    Duplicate(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Signature error: {0}")]
    Signature(String),
}

impl From<TransactionError> for PoolError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::Signature(reason) => PoolError::Signature(reason),
            TransactionError::Crypto(err) => PoolError::Signature(err.to_string()),
            other => PoolError::InvalidTransaction(other.to_string()),
        }
    }
}

/// Bounded queue of submitted, not yet mined transactions
///
/// The pool only checks structure, integrity and signatures. Balances are
/// the caller's concern: two transfers that together overdraw their sender
/// are both admitted here.
#[derive(Debug, Clone)]
pub struct TransactionPool {
    /// Pending transactions in arrival order
    pending: VecDeque<Transaction>,

    /// Hashes of everything in `pending`
    hashes: HashSet<String>,

    capacity: usize,

    clock_skew: Duration,
}

impl TransactionPool {
    pub fn new(capacity: usize, clock_skew_secs: i64) -> Self {
        TransactionPool {
            pending: VecDeque::with_capacity(capacity.min(1024)),
            hashes: HashSet::new(),
            capacity: capacity.max(1),
            clock_skew: Duration::seconds(clock_skew_secs),
        }
    }

    /// Admits a transaction checked against the local clock
    pub fn admit(&mut self, tx: Transaction) -> Result<Option<Transaction>, PoolError> {
        self.admit_at(tx, Utc::now())
    }

    /// Admits a transaction, treating `now` as the local time
    ///
    /// When the pool is full the oldest arrival is evicted and returned.
    pub fn admit_at(&mut self, tx: Transaction, now: DateTime<Utc>) -> Result<Option<Transaction>, PoolError> {
        if self.hashes.contains(tx.hash()) {
            return Err(PoolError::Duplicate(tx.hash().to_string()));
        }

        if tx.is_reward() {
            return Err(PoolError::InvalidTransaction(
                "reward transactions are created by the miner and cannot be submitted".to_string(),
            ));
        }

        if tx.timestamp() > now + self.clock_skew {
            return Err(PoolError::InvalidTransaction(format!(
                "timestamp {} is more than {}s ahead of local time",
                tx.timestamp(),
                self.clock_skew.num_seconds()
            )));
        }

        tx.verify()?;

        debug!("Admitted transaction {} to the pool", tx.hash());
        self.hashes.insert(tx.hash().to_string());
        self.pending.push_back(tx);

        let mut evicted = None;
        if self.pending.len() > self.capacity {
            if let Some(oldest) = self.pending.pop_front() {
                warn!("Pool full, evicted oldest transaction {}", oldest.hash());
                self.hashes.remove(oldest.hash());
                evicted = Some(oldest);
            }
        }

        Ok(evicted)
    }

    /// Up to `limit` transactions, oldest timestamp first, left in the pool
    pub fn select_for_mining(&self, limit: usize) -> Vec<Transaction> {
        let mut selected: Vec<&Transaction> = self.pending.iter().collect();
        // Stable sort keeps arrival order among equal timestamps.
        selected.sort_by_key(|tx| tx.timestamp());
        selected.into_iter().take(limit).cloned().collect()
    }

    /// Removes the transactions with matching hashes; unknown hashes are ignored
    pub fn remove<'a, I>(&mut self, hashes: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let doomed: HashSet<&str> = hashes
            .into_iter()
            .filter(|hash| self.hashes.contains(*hash))
            .collect();
        if doomed.is_empty() {
            return 0;
        }

        self.pending.retain(|tx| !doomed.contains(tx.hash()));
        for hash in &doomed {
            self.hashes.remove(*hash);
        }
        doomed.len()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.hashes.contains(hash)
    }

    /// Pending transactions in arrival order
    pub fn pending(&self) -> impl Iterator<Item = &Transaction> {
        self.pending.iter()
    }

    /// Sum of pending transfer amounts sent by `address`
    pub fn pending_outgoing(&self, address: &Address) -> f64 {
        self.pending
            .iter()
            .filter(|tx| tx.sender() == Some(address))
            .map(Transaction::amount)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
