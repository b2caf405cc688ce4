use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionError, TransactionState,
};

/// Creates and tracks transactions, and tears them down at commit/abort by
/// releasing every row lock they still hold.
pub struct TransactionManager {
    /// Next transaction ID to assign; lower ids are older for wound-wait
    next_txn_id: AtomicU32,

    lock_manager: Arc<LockManager>,

    /// Active transactions map (txn_id -> Transaction)
    active_transactions: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(0),
            lock_manager,
            active_transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new transaction
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_transactions.lock().insert(txn_id, txn.clone());
        txn
    }

    /// Commit a transaction, releasing its remaining locks
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        if matches!(
            txn.state(),
            TransactionState::Committed | TransactionState::Aborted
        ) {
            return Err(TransactionError::InvalidState(txn.id()));
        }
        self.deregister(txn.id())?;
        self.release_locks(txn);
        txn.set_state(TransactionState::Committed);
        Ok(())
    }

    /// Abort a transaction, releasing its remaining locks. Also the
    /// teardown path for transactions aborted by a wound.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        if txn.state() == TransactionState::Committed {
            return Err(TransactionError::InvalidState(txn.id()));
        }
        self.deregister(txn.id())?;
        txn.set_state(TransactionState::Aborted);
        self.release_locks(txn);
        Ok(())
    }

    /// Get a transaction by ID
    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    /// Get all active transaction IDs
    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        self.active_transactions.lock().keys().copied().collect()
    }

    fn deregister(&self, txn_id: TxnId) -> Result<(), TransactionError> {
        match self.active_transactions.lock().remove(&txn_id) {
            Some(_) => Ok(()),
            None => Err(TransactionError::InternalError(format!(
                "transaction {} not found",
                txn_id
            ))),
        }
    }

    fn release_locks(&self, txn: &Arc<Transaction>) {
        let mut rids = txn.shared_lock_rids();
        rids.extend(txn.exclusive_lock_rids());
        for rid in rids {
            self.lock_manager.unlock(txn, rid);
        }
    }
}
