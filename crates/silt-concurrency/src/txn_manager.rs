//! Transaction lifecycle: begin, commit, abort.
//!
//! The manager hands out monotonically increasing transaction ids and owns
//! the completion protocol: on either outcome every record lock is
//! released. Undoing the mutations described by the write sets is the
//! executors' job; this layer drains the records and hands them back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use silt_types::TxnId;
use tracing::debug;

use crate::lock_manager::LockManager;
use crate::transaction::{
    IndexWriteRecord, IsolationLevel, TableWriteRecord, Transaction,
};

/// Creates transactions and drives them to completion.
#[derive(Debug)]
pub struct TransactionManager {
    lock_manager: Arc<LockManager>,
    next_txn_id: AtomicU64,
}

impl TransactionManager {
    /// Create a manager issuing ids from zero.
    #[must_use]
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            lock_manager,
            next_txn_id: AtomicU64::new(0),
        }
    }

    /// The lock manager transactions from this manager lock through.
    #[must_use]
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Start a transaction at `isolation`.
    pub fn begin(&self, isolation: IsolationLevel) -> Arc<Transaction> {
        let id = TxnId::new(self.next_txn_id.fetch_add(1, Ordering::Relaxed));
        debug!(txn = %id, ?isolation, "begin");
        Arc::new(Transaction::new(id, isolation))
    }

    /// Commit: release every held lock, then mark committed. The write
    /// sets are dropped; their mutations stand.
    pub fn commit(&self, txn: &Arc<Transaction>) {
        let _ = txn.drain_write_sets();
        self.release_all_locks(txn);
        txn.set_committed();
        debug!(txn = %txn.id(), "committed");
    }

    /// Abort: mark aborted first so any lock call blocked on this
    /// transaction's behalf fails promptly, then hand back the undo
    /// records (newest first) and release every held lock.
    ///
    /// A transaction the deadlock detector already aborted keeps its
    /// recorded reason.
    pub fn abort(&self, txn: &Arc<Transaction>) -> (Vec<TableWriteRecord>, Vec<IndexWriteRecord>) {
        txn.mark_aborted(None);
        let (mut table, mut index) = txn.drain_write_sets();
        table.reverse();
        index.reverse();
        self.release_all_locks(txn);
        debug!(txn = %txn.id(), "aborted");
        (table, index)
    }

    fn release_all_locks(&self, txn: &Arc<Transaction>) {
        for rid in txn.held_locks() {
            self.lock_manager.unlock(txn, rid);
        }
    }
}
