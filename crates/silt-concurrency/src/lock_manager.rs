//! Record-level lock manager with waits-for deadlock detection.
//!
//! Each record id owns a FIFO queue of lock requests. Grants happen in
//! arrival order except that a run of compatible shared requests at the
//! head is granted together, and an upgrade re-enters the queue ahead of
//! other pending requests. Blocked requesters sleep on the queue's condvar
//! and re-check eligibility on every wake.
//!
//! A detector thread wakes on a fixed cadence, rebuilds the waits-for
//! graph from the live queues, and aborts the youngest transaction on each
//! cycle until the graph is acyclic. Victims notice on their next wake and
//! return `false` from the blocked lock call.
//!
//! # Grant invariants
//!
//! - Granted requests form a prefix of their queue; at most one exclusive
//!   request is granted, and never together with a granted shared one.
//! - At most one transaction per queue is mid-upgrade.
//! - A transaction aborted by the detector stays aborted; its lock sets
//!   never grow afterwards.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use silt_types::{Rid, TxnId};
use tracing::{debug, info, warn};

use crate::transaction::{AbortReason, IsolationLevel, Transaction, TransactionState};

/// Default deadlock-detection cadence.
pub const DEFAULT_DETECTION_INTERVAL: Duration = Duration::from_millis(50);

/// Lock manager construction options.
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Run the background deadlock detector.
    pub enable_cycle_detection: bool,
    /// How often the detector scans the queues.
    pub detection_interval: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            enable_cycle_detection: true,
            detection_interval: DEFAULT_DETECTION_INTERVAL,
        }
    }
}

/// Lock strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// One entry in a record's request queue. Holding the `Arc` lets the
/// detector reach any requester's transaction record through the queue it
/// found it in.
#[derive(Debug)]
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

#[derive(Debug, Default)]
struct QueueState {
    requests: VecDeque<LockRequest>,
    /// The one transaction currently promoting shared → exclusive here.
    upgrading: Option<TxnId>,
}

impl QueueState {
    /// Can the pending request owned by `txn_id` (mode `mode`) be granted?
    ///
    /// Scans arrival order from the front: every earlier request must be a
    /// granted one whose mode is compatible, and reaching the requester's
    /// own entry ends the scan.
    fn grantable(&self, txn_id: TxnId, mode: LockMode) -> bool {
        for request in &self.requests {
            if request.txn_id() == txn_id {
                return true;
            }
            if !request.granted {
                return false;
            }
            if request.mode == LockMode::Exclusive || mode == LockMode::Exclusive {
                return false;
            }
        }
        // The request vanished from the queue; nothing to grant.
        false
    }

    fn grant(&mut self, txn_id: TxnId) {
        if let Some(request) = self.requests.iter_mut().find(|r| r.txn_id() == txn_id) {
            request.granted = true;
        }
    }

    fn remove(&mut self, txn_id: TxnId) -> Option<LockRequest> {
        let pos = self.requests.iter().position(|r| r.txn_id() == txn_id)?;
        self.requests.remove(pos)
    }

    /// Index of the first pending request; granted requests form a prefix.
    fn granted_prefix_len(&self) -> usize {
        self.requests
            .iter()
            .position(|r| !r.granted)
            .unwrap_or(self.requests.len())
    }
}

#[derive(Debug, Default)]
struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

/// Everything behind the manager-wide latch: the queue table and the
/// waits-for graph. The latch orders ahead of every per-queue latch.
#[derive(Debug, Default)]
struct ManagerState {
    queues: HashMap<Rid, Arc<LockRequestQueue>>,
    waits_for: BTreeMap<TxnId, Vec<TxnId>>,
}

#[derive(Debug)]
struct LockManagerInner {
    state: Mutex<ManagerState>,
    shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
    detection_interval: Duration,
}

/// What one graph rebuild learned, beyond the edges themselves.
struct GraphSnapshot {
    edges: BTreeMap<TxnId, Vec<TxnId>>,
    /// Any live transaction seen in a queue, for victim lookup.
    txns: HashMap<TxnId, Arc<Transaction>>,
    /// The queues each blocked transaction is waiting in, for targeted
    /// wakeup after an abort.
    waiter_queues: HashMap<TxnId, Vec<Arc<LockRequestQueue>>>,
}

/// Arbitrates shared and exclusive record locks for concurrent
/// transactions.
///
/// Lock calls block until granted or until the transaction is aborted
/// (by the detector or externally); they return `false` on abort. It is
/// the caller's responsibility not to request a lock it already holds on
/// the same record — read-then-write paths go through
/// [`lock_upgrade`](Self::lock_upgrade).
#[derive(Debug)]
pub struct LockManager {
    inner: Arc<LockManagerInner>,
    detector: Option<JoinHandle<()>>,
}

impl LockManager {
    /// Create a lock manager; spawns the detector thread when enabled.
    #[must_use]
    pub fn new(config: LockManagerConfig) -> Self {
        let inner = Arc::new(LockManagerInner {
            state: Mutex::new(ManagerState::default()),
            shutdown: Mutex::new(false),
            shutdown_cv: Condvar::new(),
            detection_interval: config.detection_interval,
        });

        let detector = if config.enable_cycle_detection {
            let thread_inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name("silt-deadlock-detector".into())
                .spawn(move || Self::detector_loop(&thread_inner))
                .expect("failed to spawn deadlock detector thread");
            info!(interval_ms = config.detection_interval.as_millis() as u64,
                "cycle detection thread launched");
            Some(handle)
        } else {
            None
        };

        Self { inner, detector }
    }

    // --- Locking ---

    /// Acquire a shared lock on `rid`, blocking until granted.
    ///
    /// Returns `false` if the transaction is (or becomes) aborted, or if
    /// its isolation level and phase forbid the request — in which case the
    /// transaction is aborted with the matching reason.
    pub fn lock_shared(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        if txn.state() == TransactionState::Aborted {
            return false;
        }
        if let Err(reason) = Self::shared_precondition(txn) {
            Self::abort_implicitly(txn, reason);
            return false;
        }
        self.lock_and_wait(txn, rid, LockMode::Shared)
    }

    /// Acquire an exclusive lock on `rid`, blocking until granted.
    ///
    /// Requesting an exclusive lock on a record the transaction already
    /// holds a shared lock on is a caller error; use
    /// [`lock_upgrade`](Self::lock_upgrade).
    pub fn lock_exclusive(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        if txn.state() == TransactionState::Aborted {
            return false;
        }
        debug_assert!(
            !txn.holds_shared(rid),
            "exclusive request on a record already held shared; use lock_upgrade"
        );
        if let Err(reason) = Self::exclusive_precondition(txn) {
            Self::abort_implicitly(txn, reason);
            return false;
        }
        self.lock_and_wait(txn, rid, LockMode::Exclusive)
    }

    /// Promote an already-held shared lock on `rid` to exclusive.
    ///
    /// At most one upgrade may be pending per record; a second upgrader is
    /// aborted with [`AbortReason::UpgradeConflict`]. The upgraded request
    /// re-enters the queue ahead of all other pending requests and waits
    /// for the remaining shared holders to drain.
    pub fn lock_upgrade(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        if txn.state() == TransactionState::Aborted {
            return false;
        }
        if let Err(reason) = Self::upgrade_precondition(txn) {
            Self::abort_implicitly(txn, reason);
            return false;
        }

        let queue = self.queue(rid);
        let mut q = queue.state.lock();

        if q.upgrading.is_some() {
            drop(q);
            Self::abort_implicitly(txn, AbortReason::UpgradeConflict);
            return false;
        }
        let Some(request) = q.remove(txn.id()) else {
            // No shared lock here to upgrade.
            return false;
        };
        debug_assert!(
            request.granted && request.mode == LockMode::Shared,
            "upgrade requires a granted shared lock"
        );

        // Re-enter as a pending exclusive request ahead of other waiters:
        // upgrades outrank arrivals, but still wait out the current shared
        // holders.
        q.upgrading = Some(txn.id());
        let slot = q.granted_prefix_len();
        q.requests
            .insert(slot, LockRequest::new(Arc::clone(txn), LockMode::Exclusive));

        loop {
            if txn.state() == TransactionState::Aborted {
                q.remove(txn.id());
                q.upgrading = None;
                // The shared lock was consumed by the upgrade attempt.
                txn.clear_lock(rid);
                queue.cv.notify_all();
                return false;
            }
            if q.grantable(txn.id(), LockMode::Exclusive) {
                if txn.promote_to_exclusive(rid) {
                    q.grant(txn.id());
                    q.upgrading = None;
                    queue.cv.notify_all();
                    return true;
                }
                // Aborted between the state check and the promotion.
                q.remove(txn.id());
                q.upgrading = None;
                txn.clear_lock(rid);
                queue.cv.notify_all();
                return false;
            }
            queue.cv.wait(&mut q);
        }
    }

    /// Release the lock `txn` holds on `rid`.
    ///
    /// Returns `false` if no such lock is held. Moves the transaction to
    /// the shrinking phase according to its isolation level: always under
    /// `RepeatableRead`, only on exclusive release otherwise.
    pub fn unlock(&self, txn: &Arc<Transaction>, rid: Rid) -> bool {
        let Some(queue) = self.existing_queue(rid) else {
            return false;
        };
        let mut q = queue.state.lock();
        let Some(removed) = q.remove(txn.id()) else {
            return false;
        };
        txn.clear_lock(rid);

        let enters_shrinking = match txn.isolation() {
            IsolationLevel::RepeatableRead => true,
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                removed.mode == LockMode::Exclusive
            }
        };
        if enters_shrinking {
            txn.set_shrinking();
        }

        queue.cv.notify_all();
        true
    }

    // --- Waits-for graph (diagnostics and tests) ---

    /// Add the edge `waiter → holder` to the waits-for graph.
    pub fn add_edge(&self, waiter: TxnId, holder: TxnId) {
        let mut state = self.inner.state.lock();
        let neighbors = state.waits_for.entry(waiter).or_default();
        if let Err(slot) = neighbors.binary_search(&holder) {
            neighbors.insert(slot, holder);
        }
    }

    /// Remove the edge `waiter → holder`, if present.
    pub fn remove_edge(&self, waiter: TxnId, holder: TxnId) {
        let mut state = self.inner.state.lock();
        let now_empty = match state.waits_for.get_mut(&waiter) {
            Some(neighbors) => {
                if let Ok(slot) = neighbors.binary_search(&holder) {
                    neighbors.remove(slot);
                }
                neighbors.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.waits_for.remove(&waiter);
        }
    }

    /// Snapshot of all edges, waiter first.
    #[must_use]
    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        let state = self.inner.state.lock();
        state
            .waits_for
            .iter()
            .flat_map(|(&waiter, holders)| holders.iter().map(move |&h| (waiter, h)))
            .collect()
    }

    /// Single-shot cycle check on the current graph. Returns the youngest
    /// transaction on the first cycle found by the deterministic DFS.
    #[must_use]
    pub fn has_cycle(&self) -> Option<TxnId> {
        let state = self.inner.state.lock();
        Self::cycle_victim(&state.waits_for)
    }

    /// Rebuild the graph from the live queues and abort victims until it is
    /// acyclic. The detector thread calls this on its cadence; it is public
    /// so diagnostics and tests can force a pass.
    pub fn run_detection_pass(&self) {
        Self::run_pass(&self.inner);
    }

    // --- Internals ---

    fn shared_precondition(txn: &Transaction) -> Result<(), AbortReason> {
        match txn.isolation() {
            IsolationLevel::ReadUncommitted => Err(AbortReason::LockSharedOnReadUncommitted),
            // Read-committed releases shared locks early, so re-reading in
            // the shrinking phase is legal.
            IsolationLevel::ReadCommitted => Ok(()),
            IsolationLevel::RepeatableRead => {
                if txn.state() == TransactionState::Growing {
                    Ok(())
                } else {
                    Err(AbortReason::LockOnShrinking)
                }
            }
        }
    }

    fn exclusive_precondition(txn: &Transaction) -> Result<(), AbortReason> {
        if txn.state() == TransactionState::Growing {
            Ok(())
        } else {
            Err(AbortReason::LockOnShrinking)
        }
    }

    fn upgrade_precondition(txn: &Transaction) -> Result<(), AbortReason> {
        match txn.isolation() {
            IsolationLevel::ReadUncommitted => Err(AbortReason::LockSharedOnReadUncommitted),
            IsolationLevel::ReadCommitted => Ok(()),
            IsolationLevel::RepeatableRead => {
                if txn.state() == TransactionState::Growing {
                    Ok(())
                } else {
                    Err(AbortReason::LockOnShrinking)
                }
            }
        }
    }

    fn abort_implicitly(txn: &Arc<Transaction>, reason: AbortReason) {
        debug!(txn = %txn.id(), %reason, "aborting transaction");
        txn.mark_aborted(Some(reason));
    }

    /// Append a request and wait until it is granted or the transaction is
    /// aborted. Common body of `lock_shared` and `lock_exclusive`.
    fn lock_and_wait(&self, txn: &Arc<Transaction>, rid: Rid, mode: LockMode) -> bool {
        let queue = self.queue(rid);
        let mut q = queue.state.lock();
        q.requests.push_back(LockRequest::new(Arc::clone(txn), mode));

        loop {
            if txn.state() == TransactionState::Aborted {
                q.remove(txn.id());
                queue.cv.notify_all();
                return false;
            }
            if q.grantable(txn.id(), mode) {
                let recorded = match mode {
                    LockMode::Shared => txn.record_shared_grant(rid),
                    LockMode::Exclusive => txn.record_exclusive_grant(rid),
                };
                if recorded {
                    q.grant(txn.id());
                    queue.cv.notify_all();
                    return true;
                }
                // Aborted between the state check and the grant.
                q.remove(txn.id());
                queue.cv.notify_all();
                return false;
            }
            queue.cv.wait(&mut q);
        }
    }

    /// Get or create the queue for `rid` under the manager latch.
    fn queue(&self, rid: Rid) -> Arc<LockRequestQueue> {
        let mut state = self.inner.state.lock();
        Arc::clone(state.queues.entry(rid).or_default())
    }

    fn existing_queue(&self, rid: Rid) -> Option<Arc<LockRequestQueue>> {
        self.inner.state.lock().queues.get(&rid).map(Arc::clone)
    }

    fn detector_loop(inner: &Arc<LockManagerInner>) {
        loop {
            {
                let mut stop = inner.shutdown.lock();
                if *stop {
                    break;
                }
                // Sleep one cadence; a shutdown notification cuts it short.
                let _ = inner
                    .shutdown_cv
                    .wait_for(&mut stop, inner.detection_interval);
                if *stop {
                    break;
                }
            }
            Self::run_pass(inner);
        }
    }

    /// One detection pass: rebuild, break one cycle, repeat until acyclic.
    fn run_pass(inner: &LockManagerInner) {
        let mut state = inner.state.lock();
        loop {
            let snapshot = Self::build_graph(&state.queues);
            state.waits_for = snapshot.edges;

            let Some(victim) = Self::cycle_victim(&state.waits_for) else {
                break;
            };
            warn!(victim = %victim, "deadlock detected; aborting youngest transaction");
            if let Some(txn) = snapshot.txns.get(&victim) {
                txn.mark_aborted(Some(AbortReason::Deadlock));
            }
            state.waits_for.remove(&victim);
            if let Some(queues) = snapshot.waiter_queues.get(&victim) {
                for queue in queues {
                    queue.cv.notify_all();
                }
            }
        }
    }

    /// Build waiter → holder edges from every queue. Only live (non-aborted)
    /// transactions participate. Adjacency lists come out sorted, so the
    /// DFS below is deterministic.
    fn build_graph(queues: &HashMap<Rid, Arc<LockRequestQueue>>) -> GraphSnapshot {
        let mut edges: BTreeMap<TxnId, Vec<TxnId>> = BTreeMap::new();
        let mut txns: HashMap<TxnId, Arc<Transaction>> = HashMap::new();
        let mut waiter_queues: HashMap<TxnId, Vec<Arc<LockRequestQueue>>> = HashMap::new();

        for queue in queues.values() {
            let q = queue.state.lock();
            let live = |r: &LockRequest| r.txn.state() != TransactionState::Aborted;
            let holders: Vec<TxnId> = q
                .requests
                .iter()
                .filter(|r| r.granted && live(r))
                .map(LockRequest::txn_id)
                .collect();

            for request in q.requests.iter().filter(|r| !r.granted && live(r)) {
                let waiter = request.txn_id();
                txns.entry(waiter).or_insert_with(|| Arc::clone(&request.txn));
                waiter_queues
                    .entry(waiter)
                    .or_default()
                    .push(Arc::clone(queue));
                for &holder in holders.iter().filter(|&&h| h != waiter) {
                    edges.entry(waiter).or_default().push(holder);
                }
            }
        }

        for neighbors in edges.values_mut() {
            neighbors.sort_unstable();
            neighbors.dedup();
        }
        GraphSnapshot {
            edges,
            txns,
            waiter_queues,
        }
    }

    /// Deterministic DFS over the graph: roots in ascending id order,
    /// neighbors likewise. On the first back edge, the victim is the
    /// youngest (largest-id) transaction on the cycle.
    fn cycle_victim(graph: &BTreeMap<TxnId, Vec<TxnId>>) -> Option<TxnId> {
        #[derive(Clone, Copy, PartialEq)]
        enum Tag {
            InStack,
            Done,
        }
        const EMPTY: &[TxnId] = &[];

        let mut tags: HashMap<TxnId, Tag> = HashMap::new();

        for &root in graph.keys() {
            if tags.contains_key(&root) {
                continue;
            }
            let mut stack: Vec<TxnId> = vec![root];
            let mut cursors: Vec<usize> = vec![0];
            tags.insert(root, Tag::InStack);

            while let Some(&node) = stack.last() {
                let neighbors = graph.get(&node).map_or(EMPTY, Vec::as_slice);
                let cursor = cursors.last_mut().expect("cursor per stack entry");
                if *cursor < neighbors.len() {
                    let next = neighbors[*cursor];
                    *cursor += 1;
                    match tags.get(&next) {
                        Some(Tag::InStack) => {
                            // Cycle: everything from `next`'s stack position
                            // to the top is on it.
                            let start = stack
                                .iter()
                                .position(|&t| t == next)
                                .expect("in-stack tag matches stack");
                            return stack[start..].iter().copied().max();
                        }
                        Some(Tag::Done) => {}
                        None => {
                            tags.insert(next, Tag::InStack);
                            stack.push(next);
                            cursors.push(0);
                        }
                    }
                } else {
                    tags.insert(node, Tag::Done);
                    stack.pop();
                    cursors.pop();
                }
            }
        }
        None
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(LockManagerConfig::default())
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        if let Some(handle) = self.detector.take() {
            *self.inner.shutdown.lock() = true;
            self.inner.shutdown_cv.notify_all();
            let _ = handle.join();
            info!("cycle detection thread stopped");
        }
    }
}
