use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use log::warn;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::common::types::{Rid, TxnId, INVALID_TXN_ID};
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};

/// Row lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    granted: bool,
}

impl LockRequest {
    fn new(txn: Arc<Transaction>, mode: LockMode) -> Self {
        Self {
            txn,
            mode,
            granted: false,
        }
    }

    fn txn_id(&self) -> TxnId {
        self.txn.id()
    }
}

struct LockRequestQueue {
    requests: VecDeque<LockRequest>,
    // Transaction currently upgrading S -> X on this row, at most one
    upgrading: TxnId,
    cv: Arc<Condvar>,
}

impl Default for LockRequestQueue {
    fn default() -> Self {
        Self {
            requests: VecDeque::new(),
            upgrading: INVALID_TXN_ID,
            cv: Arc::new(Condvar::new()),
        }
    }
}

type LockTable = HashMap<Rid, LockRequestQueue>;

/// Row lock manager implementing shared/exclusive locks with lock upgrade,
/// two-phase locking under three isolation levels, and wound-wait deadlock
/// prevention: an arriving older transaction aborts the younger conflicting
/// holders and waiters instead of queueing behind them.
///
/// One mutex guards the whole lock table; waiters block on their queue's
/// condition variable and must re-check their request and transaction state
/// after every wakeup, since a wound may have removed them in the meantime.
pub struct LockManager {
    latch: Mutex<LockTable>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            latch: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a shared lock on `rid`.
    ///
    /// Read-uncommitted transactions never take shared locks, and a
    /// repeatable-read transaction that has started shrinking may not lock
    /// again; both are 2PL violations that abort the transaction.
    pub fn lock_shared(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        if txn.state() == TransactionState::Aborted {
            return false;
        }
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        if txn.isolation_level() == IsolationLevel::RepeatableRead
            && txn.state() == TransactionState::Shrinking
        {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        if txn.is_shared_locked(rid) || txn.is_exclusive_locked(rid) {
            return true;
        }

        let mut table = self.latch.lock();
        {
            let queue = table.entry(rid).or_default();
            // A shared request only conflicts with younger writers
            Self::wound_younger(queue, txn.id(), rid, true);
            queue
                .requests
                .push_back(LockRequest::new(txn.clone(), LockMode::Shared));
            Self::grant_locks(queue);
        }

        if !self.wait_for_grant(&mut table, txn, rid) {
            return false;
        }
        txn.add_shared_lock(rid);
        true
    }

    /// Acquire an exclusive lock on `rid`.
    ///
    /// Returns false without aborting when the transaction already holds a
    /// shared lock; that caller must go through `lock_upgrade`.
    pub fn lock_exclusive(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        if txn.state() == TransactionState::Aborted {
            return false;
        }
        if txn.state() == TransactionState::Shrinking
            && matches!(
                txn.isolation_level(),
                IsolationLevel::ReadCommitted | IsolationLevel::RepeatableRead
            )
        {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        if txn.is_exclusive_locked(rid) {
            return true;
        }
        if txn.is_shared_locked(rid) {
            return false;
        }

        let mut table = self.latch.lock();
        {
            let queue = table.entry(rid).or_default();
            // A writer conflicts with every younger request
            Self::wound_younger(queue, txn.id(), rid, false);
            queue
                .requests
                .push_back(LockRequest::new(txn.clone(), LockMode::Exclusive));
            Self::grant_locks(queue);
        }

        if !self.wait_for_grant(&mut table, txn, rid) {
            return false;
        }
        txn.add_exclusive_lock(rid);
        true
    }

    /// Upgrade an already-held shared lock to exclusive. Only one upgrade
    /// may be pending per row; a second upgrader aborts immediately, which
    /// breaks the classic upgrade deadlock.
    pub fn lock_upgrade(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        if txn.state() == TransactionState::Aborted {
            return false;
        }
        if txn.is_exclusive_locked(rid) {
            return true;
        }
        if !txn.is_shared_locked(rid) {
            return false;
        }

        let mut table = self.latch.lock();
        let queue = match table.get_mut(&rid) {
            Some(queue) => queue,
            None => return false,
        };
        if queue.upgrading != INVALID_TXN_ID {
            txn.set_state(TransactionState::Aborted);
            return false;
        }

        // Swap the shared request for an exclusive one placed right after
        // the run of shared requests at the queue head
        queue.requests.retain(|r| r.txn_id() != txn.id());
        txn.remove_shared_lock(rid);
        Self::wound_younger(queue, txn.id(), rid, false);

        let insert_at = queue
            .requests
            .iter()
            .take_while(|r| r.mode == LockMode::Shared)
            .count();
        queue
            .requests
            .insert(insert_at, LockRequest::new(txn.clone(), LockMode::Exclusive));
        queue.upgrading = txn.id();
        Self::grant_locks(queue);

        if !self.wait_for_grant(&mut table, txn, rid) {
            if let Some(queue) = table.get_mut(&rid) {
                if queue.upgrading == txn.id() {
                    queue.upgrading = INVALID_TXN_ID;
                }
            }
            return false;
        }
        if let Some(queue) = table.get_mut(&rid) {
            if queue.upgrading == txn.id() {
                queue.upgrading = INVALID_TXN_ID;
            }
        }
        txn.add_exclusive_lock(rid);
        true
    }

    /// Release a granted lock, applying the two-phase transition: releasing
    /// an exclusive lock, or a shared lock under repeatable read, moves a
    /// growing transaction into its shrinking phase. Shared locks under
    /// read committed may be released without shrinking.
    pub fn unlock(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        let mut table = self.latch.lock();

        let mut now_empty = false;
        let released = match table.get_mut(&rid) {
            Some(queue) => {
                let pos = queue
                    .requests
                    .iter()
                    .position(|r| r.txn_id() == txn.id() && r.granted);
                match pos {
                    Some(pos) => {
                        let mode = queue.requests[pos].mode;
                        if txn.state() == TransactionState::Growing {
                            let shrinks = mode == LockMode::Exclusive
                                || txn.isolation_level() == IsolationLevel::RepeatableRead;
                            if shrinks {
                                txn.set_state(TransactionState::Shrinking);
                            }
                        }
                        queue.requests.remove(pos);
                        txn.remove_shared_lock(rid);
                        txn.remove_exclusive_lock(rid);

                        if queue.requests.is_empty() {
                            now_empty = true;
                        } else if !queue.requests.iter().any(|r| r.granted) {
                            // The released lock was the last granted one
                            Self::grant_locks(queue);
                        }
                        true
                    }
                    None => false,
                }
            }
            None => false,
        };

        if now_empty {
            table.remove(&rid);
        }
        released
    }

    /// Block until our request is granted or the transaction is aborted by
    /// a wound. Returns true on grant. On abort, any request a wound left
    /// behind is removed and the queue re-evaluated.
    fn wait_for_grant(
        &self,
        table: &mut MutexGuard<'_, LockTable>,
        txn: &Arc<Transaction>,
        rid: Rid,
    ) -> bool {
        loop {
            let granted = table
                .get(&rid)
                .and_then(|queue| queue.requests.iter().find(|r| r.txn_id() == txn.id()))
                .map(|r| r.granted);

            if granted == Some(true) {
                return true;
            }
            if txn.state() == TransactionState::Aborted || granted.is_none() {
                let mut now_empty = false;
                if let Some(queue) = table.get_mut(&rid) {
                    queue.requests.retain(|r| r.txn_id() != txn.id());
                    if queue.upgrading == txn.id() {
                        queue.upgrading = INVALID_TXN_ID;
                    }
                    if queue.requests.is_empty() {
                        now_empty = true;
                    } else {
                        Self::grant_locks(queue);
                    }
                }
                if now_empty {
                    table.remove(&rid);
                }
                return false;
            }

            let cv = table
                .get(&rid)
                .map(|queue| queue.cv.clone())
                .expect("waiting request must have a queue");
            cv.wait(table);
        }
    }

    /// Abort every younger conflicting request on the queue. Shared
    /// requests only conflict with younger exclusives
    /// (`exclusive_only = true`); exclusive requests conflict with all.
    fn wound_younger(queue: &mut LockRequestQueue, txn_id: TxnId, rid: Rid, exclusive_only: bool) {
        let mut wounded = Vec::new();
        queue.requests.retain(|req| {
            let conflicts = !exclusive_only || req.mode == LockMode::Exclusive;
            if req.txn_id() > txn_id && conflicts {
                if req.granted {
                    req.txn.remove_shared_lock(rid);
                    req.txn.remove_exclusive_lock(rid);
                }
                req.txn.set_state(TransactionState::Aborted);
                wounded.push(req.txn_id());
                false
            } else {
                true
            }
        });

        if !wounded.is_empty() {
            warn!(
                "wound-wait: txn {} aborted younger txns {:?} on row {}",
                txn_id, wounded, rid
            );
            if wounded.contains(&queue.upgrading) {
                queue.upgrading = INVALID_TXN_ID;
            }
            queue.cv.notify_all();
        }
    }

    /// Grant a run of shared requests from the queue head, or the head
    /// exclusive request when no shared precedes it, then wake waiters.
    fn grant_locks(queue: &mut LockRequestQueue) {
        let mut saw_shared = false;
        for req in queue.requests.iter_mut() {
            match req.mode {
                LockMode::Shared => {
                    req.granted = true;
                    saw_shared = true;
                }
                LockMode::Exclusive => {
                    if !saw_shared {
                        req.granted = true;
                    }
                    break;
                }
            }
        }
        queue.cv.notify_all();
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
