//! The transaction manager: id allocation, the active-transaction list, and
//! engine-wide early-lock-release policy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use basalt_error::{BasaltError, Result};
use basalt_log::LogManager;
use basalt_types::TxnId;
use parking_lot::Mutex;
use tracing::debug;

use crate::lock::LockTable;
use crate::state::ElrMode;
use crate::txn::Txn;

/// Default lock/space wait timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide transaction manager.
pub struct TxnManager {
    log: Arc<LogManager>,
    locks: Arc<LockTable>,
    /// The engine-wide ELR mode. All modes except `None` only work when
    /// every transaction that could interact uses the same mode, so the
    /// manager owns the setting and rejects divergent requests.
    elr: ElrMode,
    next_tid: AtomicU64,
    active: Mutex<BTreeMap<u64, Arc<Txn>>>,
}

impl TxnManager {
    #[must_use]
    pub fn new(log: Arc<LogManager>, elr: ElrMode) -> Self {
        Self {
            log,
            locks: Arc::new(LockTable::new()),
            elr,
            next_tid: AtomicU64::new(1),
            active: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn elr_mode(&self) -> ElrMode {
        self.elr
    }

    #[must_use]
    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.locks
    }

    /// Begin a user transaction with the default timeout.
    pub fn begin(&self) -> Result<Arc<Txn>> {
        self.begin_with(DEFAULT_TIMEOUT, self.elr)
    }

    /// Begin with an explicit timeout and ELR mode. A mode different from
    /// the engine-wide one is rejected: mixed deployments break the
    /// watermark protocol.
    pub fn begin_with(&self, timeout: Duration, elr: ElrMode) -> Result<Arc<Txn>> {
        if elr != self.elr {
            return Err(BasaltError::ElrModeMismatch {
                engine: self.elr.name(),
                asked: elr.name(),
            });
        }
        Ok(self.spawn(timeout, false, false))
    }

    /// Begin a system transaction (not visible to applications; exempt from
    /// user locking).
    pub fn begin_sys(&self, single_log: bool) -> Arc<Txn> {
        self.spawn(DEFAULT_TIMEOUT, true, single_log)
    }

    fn spawn(&self, timeout: Duration, sys: bool, single_log: bool) -> Arc<Txn> {
        let tid = TxnId::new(self.next_tid.fetch_add(1, Ordering::Relaxed));
        let txn = Arc::new(Txn::new(
            tid,
            Arc::clone(&self.log),
            Arc::clone(&self.locks),
            self.elr,
            timeout,
            sys,
            single_log,
        ));
        self.active.lock().insert(tid.get(), Arc::clone(&txn));
        debug!(target: "basalt.txn", txn = %tid, sys, "begin");
        txn
    }

    /// Commit a batch of transactions with a single durability wait: each
    /// commits lazily, then the log is flushed once to cover the highest
    /// commit record (and read watermark) in the group.
    pub fn group_commit(&self, txns: &[Arc<Txn>]) -> Result<Vec<crate::txn::CommitOutcome>> {
        let mut outcomes = Vec::with_capacity(txns.len());
        let mut high = basalt_types::Lsn::NULL;
        for txn in txns {
            let watermark = txn.read_watermark();
            let outcome = txn.commit_lazy()?;
            if outcome.last_lsn > high {
                high = outcome.last_lsn;
            }
            if self.elr.readers_check_watermark() && watermark > high {
                high = watermark;
            }
            outcomes.push(outcome);
        }
        if !high.is_null() {
            self.log.wait_durable(high.advance(1))?;
        }
        debug!(target: "basalt.txn", group = txns.len(), high = %high, "group commit");
        Ok(outcomes)
    }

    /// Remove an ended transaction from the active list.
    pub fn finish(&self, txn: &Txn) {
        debug_assert!(txn.state().is_terminal(), "finish before Ended");
        self.active.lock().remove(&txn.tid().get());
    }

    #[must_use]
    pub fn lookup(&self, tid: TxnId) -> Option<Arc<Txn>> {
        self.active.lock().get(&tid.get()).cloned()
    }

    /// Lowest active transaction id (checkpoint low-water mark).
    #[must_use]
    pub fn oldest_tid(&self) -> Option<TxnId> {
        self.active.lock().keys().next().copied().map(TxnId::new)
    }

    /// Highest transaction id handed out so far.
    #[must_use]
    pub fn youngest_tid(&self) -> TxnId {
        TxnId::new(self.next_tid.load(Ordering::Relaxed).saturating_sub(1))
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Poison every active transaction (checkpoint unsticking).
    pub fn force_all_nonblocking(&self) {
        for txn in self.active.lock().values() {
            txn.force_nonblocking();
        }
    }
}

impl std::fmt::Debug for TxnManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnManager")
            .field("elr", &self.elr)
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}
