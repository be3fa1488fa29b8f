//! The per-transaction record.
//!
//! A [`Transaction`] is a passive store: the lock manager mutates its phase,
//! lock sets, and abort reason; executors append undo records to its write
//! sets. All interior state sits behind one mutex so that the deadlock
//! detector can abort a transaction from its own thread while the owning
//! thread is blocked in a lock call.

use std::collections::HashSet;

use parking_lot::Mutex;
use silt_types::{Rid, TxnId};

/// Isolation level, fixed at transaction start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Dirty reads permitted: shared locks are never taken.
    ReadUncommitted,
    /// Shared locks are taken and released eagerly; only exclusive locks
    /// follow two-phase discipline.
    ReadCommitted,
    /// Full strict two-phase locking for both modes.
    RepeatableRead,
}

/// Two-phase-locking phase plus the two terminal states.
///
/// ```text
/// Growing --(unlock)--> Shrinking --(commit)--> Committed
/// Growing --(commit)--> Committed
/// {Growing, Shrinking} --(abort)--> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why the lock manager aborted a transaction on its behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Chosen as the youngest transaction on a waits-for cycle.
    Deadlock,
    /// Requested an upgrade while another upgrade was pending on the same
    /// record.
    UpgradeConflict,
    /// Requested a lock after entering the shrinking phase.
    LockOnShrinking,
    /// Requested a shared lock under `ReadUncommitted`.
    LockSharedOnReadUncommitted,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::Deadlock => "deadlock victim",
            Self::UpgradeConflict => "conflicting lock upgrade",
            Self::LockOnShrinking => "lock request in shrinking phase",
            Self::LockSharedOnReadUncommitted => "shared lock under read-uncommitted",
        };
        f.write_str(msg)
    }
}

/// Kind of mutation an undo record reverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Delete,
    Update,
}

/// Undo record for a table mutation. Appended by executors on successful
/// writes; drained on rollback. The lock manager never interprets these.
#[derive(Debug, Clone)]
pub struct TableWriteRecord {
    pub rid: Rid,
    pub op: WriteOp,
    /// Pre-image of the tuple for updates and deletes, empty for inserts.
    pub tuple: Vec<u8>,
}

/// Undo record for an index mutation.
#[derive(Debug, Clone)]
pub struct IndexWriteRecord {
    pub rid: Rid,
    pub op: WriteOp,
    /// The indexed key bytes the mutation touched.
    pub key: Vec<u8>,
}

#[derive(Debug)]
struct TxnInner {
    state: TransactionState,
    abort_reason: Option<AbortReason>,
    shared_locks: HashSet<Rid>,
    exclusive_locks: HashSet<Rid>,
    table_writes: Vec<TableWriteRecord>,
    index_writes: Vec<IndexWriteRecord>,
}

/// One transaction's mutable record.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    isolation: IsolationLevel,
    inner: Mutex<TxnInner>,
}

impl Transaction {
    /// Create a fresh transaction in the growing phase.
    #[must_use]
    pub fn new(id: TxnId, isolation: IsolationLevel) -> Self {
        Self {
            id,
            isolation,
            inner: Mutex::new(TxnInner {
                state: TransactionState::Growing,
                abort_reason: None,
                shared_locks: HashSet::new(),
                exclusive_locks: HashSet::new(),
                table_writes: Vec::new(),
                index_writes: Vec::new(),
            }),
        }
    }

    /// This transaction's id. Larger ids are younger.
    #[inline]
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// The isolation level the transaction was started with.
    #[inline]
    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Why the lock manager aborted this transaction, if it did.
    #[must_use]
    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.inner.lock().abort_reason
    }

    /// Enter the shrinking phase. Only transitions out of `Growing`;
    /// terminal states and `Shrinking` itself are left alone, which is what
    /// lets rollback release locks without bouncing the state around.
    pub fn set_shrinking(&self) {
        let mut inner = self.inner.lock();
        if inner.state == TransactionState::Growing {
            inner.state = TransactionState::Shrinking;
        }
    }

    /// Mark the transaction committed.
    pub fn set_committed(&self) {
        self.inner.lock().state = TransactionState::Committed;
    }

    /// Mark the transaction aborted. A reason is recorded only if one is
    /// given and none was recorded before, so the first abort cause wins.
    pub fn mark_aborted(&self, reason: Option<AbortReason>) {
        let mut inner = self.inner.lock();
        inner.state = TransactionState::Aborted;
        if inner.abort_reason.is_none() {
            inner.abort_reason = reason;
        }
    }

    /// Record a granted shared lock. Refused (returns `false`) once the
    /// transaction is aborted: an aborted transaction's lock sets never
    /// grow.
    pub fn record_shared_grant(&self, rid: Rid) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == TransactionState::Aborted {
            return false;
        }
        inner.shared_locks.insert(rid);
        true
    }

    /// Record a granted exclusive lock. Refused once aborted.
    pub fn record_exclusive_grant(&self, rid: Rid) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == TransactionState::Aborted {
            return false;
        }
        inner.exclusive_locks.insert(rid);
        true
    }

    /// Move `rid` from the shared to the exclusive set on a completed
    /// upgrade. Refused once aborted.
    pub fn promote_to_exclusive(&self, rid: Rid) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == TransactionState::Aborted {
            return false;
        }
        inner.shared_locks.remove(&rid);
        inner.exclusive_locks.insert(rid);
        true
    }

    /// Forget `rid` in both lock sets. Shrinking a set is always allowed,
    /// aborted or not.
    pub fn clear_lock(&self, rid: Rid) {
        let mut inner = self.inner.lock();
        inner.shared_locks.remove(&rid);
        inner.exclusive_locks.remove(&rid);
    }

    /// Returns `true` if this transaction holds a shared lock on `rid`.
    #[must_use]
    pub fn holds_shared(&self, rid: Rid) -> bool {
        self.inner.lock().shared_locks.contains(&rid)
    }

    /// Returns `true` if this transaction holds an exclusive lock on `rid`.
    #[must_use]
    pub fn holds_exclusive(&self, rid: Rid) -> bool {
        self.inner.lock().exclusive_locks.contains(&rid)
    }

    /// Snapshot of every record this transaction currently holds a lock on.
    #[must_use]
    pub fn held_locks(&self) -> Vec<Rid> {
        let inner = self.inner.lock();
        inner
            .shared_locks
            .iter()
            .chain(inner.exclusive_locks.iter())
            .copied()
            .collect()
    }

    /// Number of shared locks held.
    #[must_use]
    pub fn shared_lock_count(&self) -> usize {
        self.inner.lock().shared_locks.len()
    }

    /// Number of exclusive locks held.
    #[must_use]
    pub fn exclusive_lock_count(&self) -> usize {
        self.inner.lock().exclusive_locks.len()
    }

    /// Append a table undo record.
    pub fn append_table_write(&self, record: TableWriteRecord) {
        self.inner.lock().table_writes.push(record);
    }

    /// Append an index undo record.
    pub fn append_index_write(&self, record: IndexWriteRecord) {
        self.inner.lock().index_writes.push(record);
    }

    /// Take both write sets, oldest record first. Rollback applies them in
    /// reverse.
    pub fn drain_write_sets(&self) -> (Vec<TableWriteRecord>, Vec<IndexWriteRecord>) {
        let mut inner = self.inner.lock();
        (
            std::mem::take(&mut inner.table_writes),
            std::mem::take(&mut inner.index_writes),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_types::PageId;

    fn rid(page: u64, slot: u32) -> Rid {
        Rid::new(PageId::new(page), slot)
    }

    #[test]
    fn test_phase_transitions() {
        let txn = Transaction::new(TxnId::new(1), IsolationLevel::RepeatableRead);
        assert_eq!(txn.state(), TransactionState::Growing);

        txn.set_shrinking();
        assert_eq!(txn.state(), TransactionState::Shrinking);

        // Shrinking is sticky; a second unlock must not regress anything.
        txn.set_shrinking();
        assert_eq!(txn.state(), TransactionState::Shrinking);

        txn.set_committed();
        assert_eq!(txn.state(), TransactionState::Committed);
    }

    #[test]
    fn test_abort_keeps_first_reason() {
        let txn = Transaction::new(TxnId::new(2), IsolationLevel::RepeatableRead);
        txn.mark_aborted(Some(AbortReason::UpgradeConflict));
        txn.mark_aborted(Some(AbortReason::Deadlock));
        assert_eq!(txn.abort_reason(), Some(AbortReason::UpgradeConflict));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_aborted_lock_sets_never_grow() {
        let txn = Transaction::new(TxnId::new(3), IsolationLevel::RepeatableRead);
        assert!(txn.record_shared_grant(rid(1, 0)));
        txn.mark_aborted(Some(AbortReason::Deadlock));

        assert!(!txn.record_shared_grant(rid(1, 1)));
        assert!(!txn.record_exclusive_grant(rid(1, 2)));
        assert!(!txn.promote_to_exclusive(rid(1, 0)));
        assert_eq!(txn.shared_lock_count(), 1);
        assert_eq!(txn.exclusive_lock_count(), 0);

        // Shrinking is still allowed so rollback can release.
        txn.clear_lock(rid(1, 0));
        assert_eq!(txn.shared_lock_count(), 0);
    }

    #[test]
    fn test_promote_moves_between_sets() {
        let txn = Transaction::new(TxnId::new(4), IsolationLevel::RepeatableRead);
        let r = rid(2, 7);
        assert!(txn.record_shared_grant(r));
        assert!(txn.promote_to_exclusive(r));
        assert!(!txn.holds_shared(r));
        assert!(txn.holds_exclusive(r));
    }

    #[test]
    fn test_write_sets_append_and_drain() {
        let txn = Transaction::new(TxnId::new(5), IsolationLevel::ReadCommitted);
        txn.append_table_write(TableWriteRecord {
            rid: rid(3, 0),
            op: WriteOp::Insert,
            tuple: Vec::new(),
        });
        txn.append_table_write(TableWriteRecord {
            rid: rid(3, 0),
            op: WriteOp::Update,
            tuple: vec![1, 2, 3],
        });
        txn.append_index_write(IndexWriteRecord {
            rid: rid(3, 0),
            op: WriteOp::Insert,
            key: vec![9],
        });

        let (table, index) = txn.drain_write_sets();
        assert_eq!(table.len(), 2);
        assert_eq!(table[1].op, WriteOp::Update);
        assert_eq!(index.len(), 1);

        let (table, index) = txn.drain_write_sets();
        assert!(table.is_empty() && index.is_empty());
    }
}
