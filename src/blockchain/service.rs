use std::sync::Arc;

use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::config::LedgerConfig;

use super::block::Block;
use super::chain::{Chain, ChainError};
use super::crypto::Address;
use super::ledger::{self, HistoryEntry, LedgerError};
use super::miner::{next_difficulty, CancelFlag, Candidate, Miner, MinerError, MinerState};
use super::pool::{PoolError, TransactionPool};
use super::storage::{ChainStore, Snapshot, StorageError};
use super::transaction::Transaction;

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Miner(#[from] MinerError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// The ledger engine: chain, pool and miner behind one single-writer facade
///
/// Mining rounds are serialized by `mining`. The nonce search runs with no
/// chain or pool lock held, so reads stay available while a search is in
/// progress; the append itself happens under the chain write lock, so readers
/// see a block either fully linked or not at all. Locks are always taken in
/// the order mining, persisting, chain, pool.
pub struct Blockchain {
    config: LedgerConfig,

    /// The chain of blocks
    chain: RwLock<Chain>,

    /// Pending transactions to be included in the next block
    pool: Mutex<TransactionPool>,

    miner: Miner,

    /// Held for a whole select, search, append, prune round
    mining: Mutex<()>,

    /// Stop switch of the round holding `mining`, if any
    current_round: Mutex<Option<CancelFlag>>,

    /// Held across snapshot and save so saves land in the order they were taken
    persisting: Mutex<()>,

    /// Storage for blockchain data
    store: Option<Arc<dyn ChainStore>>,
}

impl std::fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blockchain")
            .field("height", &self.chain.read().tip().index)
            .field("pending", &self.pool.lock().len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl Blockchain {
    /// Creates an in-memory blockchain holding only the genesis block
    pub fn new(config: LedgerConfig) -> Self {
        let chain = Chain::new(&config);
        let pool = TransactionPool::new(config.pool_capacity, config.clock_skew_secs);

        Blockchain {
            miner: Miner::new(&config),
            chain: RwLock::new(chain),
            pool: Mutex::new(pool),
            mining: Mutex::new(()),
            current_round: Mutex::new(None),
            persisting: Mutex::new(()),
            store: None,
            config,
        }
    }

    /// Creates a blockchain backed by `store`, reloading any saved state
    ///
    /// A reloaded chain is rebuilt block by block, so every stored hash is
    /// recomputed and checked before the node serves anything.
    pub fn with_store(config: LedgerConfig, store: Arc<dyn ChainStore>) -> Result<Self, BlockchainError> {
        let mut blockchain = Blockchain::new(config);

        match store.load()? {
            Some(snapshot) => {
                let chain = Chain::from_blocks(&blockchain.config, snapshot.blocks)?;
                info!("Loaded blockchain of {} blocks from storage", chain.len());

                let mut pool = blockchain.pool.lock();
                for tx in snapshot.pending {
                    if chain.contains_transaction(tx.hash()) {
                        continue;
                    }
                    if let Err(err) = pool.admit(tx) {
                        warn!("Dropping stored pending transaction: {}", err);
                    }
                }
                drop(pool);

                *blockchain.chain.get_mut() = chain;
            }
            None => {
                info!("No existing blockchain found in storage, starting from genesis");
            }
        }

        blockchain.store = Some(store);
        blockchain.persist()?;
        Ok(blockchain)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Validates and queues a transaction
    ///
    /// On top of pool admission this checks that the sender can cover the
    /// amount with its chain balance minus what it already has pending.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Transaction, BlockchainError> {
        let chain = self.chain.read();
        let mut pool = self.pool.lock();

        if pool.contains(tx.hash()) || chain.contains_transaction(tx.hash()) {
            return Err(PoolError::Duplicate(tx.hash().to_string()).into());
        }
        tx.verify().map_err(PoolError::from)?;

        if let Some(sender) = tx.sender() {
            let balance = ledger::balance_of(sender, &chain)?;
            let available = balance - pool.pending_outgoing(sender);

            if tx.amount() > available {
                return Err(BlockchainError::InsufficientFunds {
                    required: tx.amount(),
                    available: available.max(0.0),
                });
            }
        }

        pool.admit(tx.clone())?;
        drop(pool);
        drop(chain);

        self.persist()?;
        Ok(tx)
    }

    /// Mines the next block from pending transactions and appends it
    ///
    /// `difficulty` overrides the configured policy for this block only.
    /// While the round holds the mining lock, `cancel` is also reachable
    /// through [`Blockchain::cancel_mining`].
    pub fn mine_block(
        &self,
        miner: &Address,
        difficulty: Option<u8>,
        cancel: &CancelFlag,
    ) -> Result<Block, BlockchainError> {
        let _round = self.mining.lock();

        *self.current_round.lock() = Some(cancel.clone());
        let result = self.mine_round(miner, difficulty, cancel);
        *self.current_round.lock() = None;

        result
    }

    /// Cancels the mining round in flight; returns false when none is running
    ///
    /// Rounds still waiting for the mining lock are not affected.
    pub fn cancel_mining(&self) -> bool {
        match self.current_round.lock().as_ref() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn mine_round(&self, miner: &Address, difficulty: Option<u8>, cancel: &CancelFlag) -> Result<Block, BlockchainError> {
        let prepared = {
            let chain = self.chain.read();
            let pool = self.pool.lock();
            let difficulty = difficulty.unwrap_or_else(|| next_difficulty(&self.config.difficulty, &chain));
            self.miner.prepare(&chain, &pool, miner, difficulty)
        };

        let Candidate { block, overdrawn } = match prepared {
            Ok(candidate) => candidate,
            Err(MinerError::EmptyPool { overdrawn }) => {
                if self.miner.discard(&mut self.pool.lock(), &overdrawn) > 0 {
                    self.persist()?;
                }
                return Err(MinerError::EmptyPool { overdrawn }.into());
            }
            Err(err) => return Err(err.into()),
        };

        info!(
            "Mining block {} with {} transactions at difficulty {}",
            block.index,
            block.transactions.len(),
            block.difficulty
        );
        let block = self.miner.search(block, cancel)?;

        let block = {
            let mut chain = self.chain.write();
            let mut pool = self.pool.lock();
            self.miner.commit(&mut chain, &mut pool, block, &overdrawn)?
        };

        self.persist()?;
        Ok(block)
    }

    /// Gets the entire blockchain
    pub fn get_chain(&self) -> Vec<Block> {
        self.chain.read().blocks().to_vec()
    }

    /// Blocks from height `offset`, at most `limit` of them
    pub fn get_blocks(&self, offset: usize, limit: usize) -> Vec<Block> {
        self.chain_page(offset, limit).1
    }

    /// Chain length together with a page of blocks, read from one snapshot
    pub fn chain_page(&self, offset: usize, limit: usize) -> (usize, Vec<Block>) {
        let chain = self.chain.read();
        let blocks = chain.blocks().iter().skip(offset).take(limit).cloned().collect();
        (chain.len(), blocks)
    }

    pub fn height(&self) -> u64 {
        self.chain.read().tip().index
    }

    pub fn get_last_block(&self) -> Block {
        self.chain.read().tip().clone()
    }

    pub fn block_at(&self, height: u64) -> Result<Block, BlockchainError> {
        Ok(self.chain.read().block_at(height)?.clone())
    }

    pub fn block_by_hash(&self, hash: &str) -> Result<Block, BlockchainError> {
        Ok(self.chain.read().block_by_hash(hash)?.clone())
    }

    /// A mined transaction and the height of its block
    pub fn transaction(&self, hash: &str) -> Result<(u64, Transaction), BlockchainError> {
        let chain = self.chain.read();
        let (block, tx) = chain.transaction_by_hash(hash)?;
        Ok((block.index, tx.clone()))
    }

    /// Gets all pending transactions in arrival order
    pub fn get_pending_transactions(&self) -> Vec<Transaction> {
        self.pool.lock().pending().cloned().collect()
    }

    pub fn balance_of(&self, address: &Address) -> Result<f64, BlockchainError> {
        Ok(ledger::balance_of(address, &self.chain.read())?)
    }

    pub fn history_of(&self, address: &Address) -> Vec<HistoryEntry> {
        ledger::history_of(address, &self.chain.read())
    }

    /// Validates the whole chain, reporting the first bad block
    pub fn validate(&self) -> Result<(), BlockchainError> {
        Ok(self.chain.read().validate()?)
    }

    /// Difficulty the configured policy assigns to the next block
    pub fn next_difficulty(&self) -> u8 {
        next_difficulty(&self.config.difficulty, &self.chain.read())
    }

    pub fn miner_state(&self) -> MinerState {
        self.miner.state()
    }

    fn persist(&self) -> Result<(), BlockchainError> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let _persisting = self.persisting.lock();
        let snapshot = {
            let chain = self.chain.read();
            let pool = self.pool.lock();
            Snapshot {
                blocks: chain.blocks().to_vec(),
                pending: pool.pending().cloned().collect(),
            }
        };

        store.save(&snapshot)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Wallet;
    use crate::blockchain::ledger::Direction;
    use crate::blockchain::storage::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn blockchain() -> Blockchain {
        Blockchain::new(LedgerConfig::with_difficulty(1))
    }

    fn fund(blockchain: &Blockchain, wallet: &Wallet) {
        blockchain.mine_block(wallet.address(), None, &CancelFlag::new()).unwrap();
    }

    #[test]
    fn test_new_blockchain() {
        let blockchain = blockchain();
        let chain = blockchain.get_chain();

        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].index, 0);
        assert!(blockchain.validate().is_ok());
        assert_eq!(blockchain.miner_state(), MinerState::Idle);
    }

    #[test]
    fn test_end_to_end_transfer() {
        let blockchain = blockchain();
        let alice = Wallet::new();
        let bob = Wallet::new();
        let miner = Wallet::new();

        let genesis_miner = blockchain.config().genesis.miner.clone();
        assert_eq!(blockchain.balance_of(&genesis_miner).unwrap(), 50.0);

        fund(&blockchain, &alice);
        let alice_before = blockchain.balance_of(alice.address()).unwrap();
        let bob_before = blockchain.balance_of(bob.address()).unwrap();
        let miner_before = blockchain.balance_of(miner.address()).unwrap();

        let tx = Transaction::transfer(&alice, bob.address().clone(), 10.0);
        blockchain.submit_transaction(tx.clone()).unwrap();
        assert_eq!(blockchain.get_pending_transactions(), vec![tx.clone()]);

        let block = blockchain.mine_block(miner.address(), None, &CancelFlag::new()).unwrap();

        assert_eq!(blockchain.balance_of(alice.address()).unwrap(), alice_before - 10.0);
        assert_eq!(blockchain.balance_of(bob.address()).unwrap(), bob_before + 10.0);
        assert_eq!(blockchain.balance_of(miner.address()).unwrap(), miner_before + 50.0);
        assert!(blockchain.get_pending_transactions().is_empty());

        let history = blockchain.history_of(bob.address());
        let received: Vec<&HistoryEntry> = history
            .iter()
            .filter(|entry| entry.direction == Direction::Received)
            .collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].block_hash, block.hash);

        let (height, mined) = blockchain.transaction(tx.hash()).unwrap();
        assert_eq!(height, block.index);
        assert_eq!(mined, tx);
        assert!(blockchain.validate().is_ok());
    }

    #[test]
    fn test_double_spend_is_rejected_by_balance_check() {
        let blockchain = blockchain();
        let alice = Wallet::new();
        fund(&blockchain, &alice);

        let first = Transaction::transfer(&alice, Wallet::new().address().clone(), 30.0);
        let second = Transaction::transfer(&alice, Wallet::new().address().clone(), 30.0);

        blockchain.submit_transaction(first).unwrap();
        let err = blockchain.submit_transaction(second).unwrap_err();

        assert!(matches!(
            err,
            BlockchainError::InsufficientFunds { required, available } if required == 30.0 && available == 20.0
        ));
        assert_eq!(blockchain.get_pending_transactions().len(), 1);
    }

    #[test]
    fn test_duplicate_submissions() {
        let blockchain = blockchain();
        let alice = Wallet::new();
        fund(&blockchain, &alice);

        let tx = Transaction::transfer(&alice, Wallet::new().address().clone(), 1.0);
        blockchain.submit_transaction(tx.clone()).unwrap();
        assert!(matches!(
            blockchain.submit_transaction(tx.clone()),
            Err(BlockchainError::Pool(PoolError::Duplicate(_)))
        ));

        // Still a duplicate once mined.
        blockchain.mine_block(alice.address(), None, &CancelFlag::new()).unwrap();
        assert!(matches!(
            blockchain.submit_transaction(tx),
            Err(BlockchainError::Pool(PoolError::Duplicate(_)))
        ));
    }

    #[test]
    fn test_unfunded_sender_is_rejected() {
        let blockchain = blockchain();
        let tx = Transaction::transfer(&Wallet::new(), Wallet::new().address().clone(), 1.0);

        assert!(matches!(
            blockchain.submit_transaction(tx),
            Err(BlockchainError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_lookups_report_not_found() {
        let blockchain = blockchain();

        assert!(blockchain.block_at(0).is_ok());
        assert!(matches!(
            blockchain.block_at(7),
            Err(BlockchainError::Chain(ChainError::NotFound(_)))
        ));
        assert!(matches!(
            blockchain.block_by_hash("missing"),
            Err(BlockchainError::Chain(ChainError::NotFound(_)))
        ));
        assert!(blockchain.transaction("missing").is_err());
    }

    #[test]
    fn test_concurrent_mining_is_serialized() {
        let blockchain = Arc::new(blockchain());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let blockchain = Arc::clone(&blockchain);
                thread::spawn(move || {
                    let miner = Wallet::new();
                    blockchain.mine_block(miner.address(), None, &CancelFlag::new()).unwrap()
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(blockchain.height(), 4);
        assert!(blockchain.validate().is_ok());
    }

    #[test]
    fn test_reads_during_search_and_cancellation() {
        let blockchain = Arc::new(blockchain());
        let alice = Wallet::new();
        fund(&blockchain, &alice);
        blockchain
            .submit_transaction(Transaction::transfer(&alice, Wallet::new().address().clone(), 5.0))
            .unwrap();

        let cancel = CancelFlag::new();
        let worker = {
            let blockchain = Arc::clone(&blockchain);
            let cancel = cancel.clone();
            let miner = alice.address().clone();
            // Difficulty 64 never completes; only cancellation ends it.
            thread::spawn(move || blockchain.mine_block(&miner, Some(64), &cancel))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(blockchain.balance_of(alice.address()).unwrap(), 50.0);
        assert!(blockchain.validate().is_ok());
        assert_eq!(blockchain.get_chain().len(), 2);

        cancel.cancel();
        let result = worker.join().unwrap();

        assert!(matches!(result, Err(BlockchainError::Miner(MinerError::Cancelled { .. }))));
        assert_eq!(blockchain.height(), 1);
        assert_eq!(blockchain.get_pending_transactions().len(), 1);
        assert_eq!(blockchain.miner_state(), MinerState::Idle);
    }

    #[test]
    fn test_state_survives_reload() {
        let store: Arc<dyn ChainStore> = Arc::new(MemoryStore::new());
        let config = LedgerConfig::with_difficulty(1);
        let alice = Wallet::new();

        let pending = {
            let blockchain = Blockchain::with_store(config.clone(), Arc::clone(&store)).unwrap();
            fund(&blockchain, &alice);
            let tx = Transaction::transfer(&alice, Wallet::new().address().clone(), 5.0);
            blockchain.submit_transaction(tx.clone()).unwrap();
            tx
        };

        let reloaded = Blockchain::with_store(config, store).unwrap();
        assert_eq!(reloaded.height(), 1);
        assert_eq!(reloaded.get_pending_transactions(), vec![pending]);
        assert_eq!(reloaded.balance_of(alice.address()).unwrap(), 50.0);
    }

    /// Store whose next save stalls, to widen the window between snapshot and write
    #[derive(Default)]
    struct SlowStore {
        inner: MemoryStore,
        stall_next_save: AtomicBool,
    }

    impl ChainStore for SlowStore {
        fn load(&self) -> Result<Option<Snapshot>, StorageError> {
            self.inner.load()
        }

        fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
            if self.stall_next_save.swap(false, Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(300));
            }
            self.inner.save(snapshot)
        }
    }

    #[test]
    fn test_concurrent_saves_keep_the_latest_state() {
        let store = Arc::new(SlowStore::default());
        let config = LedgerConfig::with_difficulty(1);
        let alice = Wallet::new();

        let blockchain = Arc::new(Blockchain::with_store(config.clone(), store.clone()).unwrap());
        fund(&blockchain, &alice);

        store.stall_next_save.store(true, Ordering::SeqCst);
        let submitter = {
            let blockchain = Arc::clone(&blockchain);
            let tx = Transaction::transfer(&alice, Wallet::new().address().clone(), 5.0);
            thread::spawn(move || blockchain.submit_transaction(tx))
        };

        // Let the submission take its snapshot and stall inside save.
        thread::sleep(Duration::from_millis(50));
        blockchain.mine_block(alice.address(), None, &CancelFlag::new()).unwrap();
        submitter.join().unwrap().unwrap();

        let stored = store.load().unwrap().unwrap();
        assert_eq!(stored.blocks, blockchain.get_chain());
        assert_eq!(stored.pending, blockchain.get_pending_transactions());

        let reloaded = Blockchain::with_store(config, store).unwrap();
        assert_eq!(reloaded.height(), blockchain.height());
        assert_eq!(reloaded.height(), 2);
    }

    fn wait_until_searching(blockchain: &Blockchain) {
        for _ in 0..500 {
            if blockchain.miner_state() == MinerState::Searching {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("mining round never started searching");
    }

    #[test]
    fn test_cancel_mining_targets_the_round_in_flight() {
        let blockchain = Arc::new(blockchain());
        assert!(!blockchain.cancel_mining());

        let spawn_round = |cancel: CancelFlag| {
            let blockchain = Arc::clone(&blockchain);
            let miner = Wallet::new().address().clone();
            // Difficulty 64 never completes; only cancellation ends it.
            thread::spawn(move || blockchain.mine_block(&miner, Some(64), &cancel))
        };

        let first_flag = CancelFlag::new();
        let first = spawn_round(first_flag.clone());
        wait_until_searching(&blockchain);

        let second_flag = CancelFlag::new();
        let second = spawn_round(second_flag.clone());
        // The second round is now queued behind the mining lock.
        thread::sleep(Duration::from_millis(30));

        assert!(blockchain.cancel_mining());
        let result = first.join().unwrap();
        assert!(matches!(result, Err(BlockchainError::Miner(MinerError::Cancelled { .. }))));
        assert!(first_flag.is_cancelled());
        assert!(!second_flag.is_cancelled());

        // The queued round takes over and is the one cancelled next.
        wait_until_searching(&blockchain);
        assert!(blockchain.cancel_mining());
        let result = second.join().unwrap();
        assert!(matches!(result, Err(BlockchainError::Miner(MinerError::Cancelled { .. }))));

        assert!(!blockchain.cancel_mining());
        assert_eq!(blockchain.height(), 0);
    }

    #[test]
    fn test_unpayable_pool_counts_as_empty() {
        let mut config = LedgerConfig::with_difficulty(1);
        config.allow_empty_blocks = false;
        let store = Arc::new(MemoryStore::new());
        let blockchain = Blockchain::with_store(config, store.clone()).unwrap();

        // Straight into the pool, past the facade's balance check: alice owns nothing.
        let alice = Wallet::new();
        let mut pool = blockchain.pool.lock();
        pool.admit(Transaction::transfer(&alice, Wallet::new().address().clone(), 5.0))
            .unwrap();
        drop(pool);

        let err = blockchain
            .mine_block(alice.address(), None, &CancelFlag::new())
            .unwrap_err();

        assert!(matches!(err, BlockchainError::Miner(MinerError::EmptyPool { ref overdrawn }) if overdrawn.len() == 1));
        assert_eq!(blockchain.height(), 0);
        assert!(blockchain.get_pending_transactions().is_empty());
        assert!(store.load().unwrap().unwrap().pending.is_empty());
    }

    #[test]
    fn test_chain_page_reports_full_length() {
        let blockchain = blockchain();
        fund(&blockchain, &Wallet::new());
        fund(&blockchain, &Wallet::new());

        let (length, blocks) = blockchain.chain_page(1, 1);
        assert_eq!(length, 3);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].index, 1);

        let (length, blocks) = blockchain.chain_page(10, 5);
        assert_eq!(length, 3);
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_tampered_store_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let config = LedgerConfig::with_difficulty(1);
        let alice = Wallet::new();

        {
            let blockchain = Blockchain::with_store(config.clone(), store.clone()).unwrap();
            fund(&blockchain, &alice);
        }

        let mut snapshot = store.load().unwrap().unwrap();
        snapshot.blocks[1].reward = 1_000.0;
        store.save(&snapshot).unwrap();

        let err = Blockchain::with_store(config, store).unwrap_err();
        assert!(matches!(err, BlockchainError::Chain(ChainError::HashMismatch { index: 1, .. })));
    }
}
