//! Transactions for the basalt storage engine.
//!
//! A transaction ties together its log chain (appended through the
//! consolidation array), its lock set (released per the early-lock-release
//! policy), and its rollback machinery (compensation records drawn from a
//! pre-paid reserve, scoped by anchors).

pub mod lock;
pub mod manager;
pub mod state;
pub mod txn;

pub use lock::{LockId, LockMode, LockTable};
pub use manager::{DEFAULT_TIMEOUT, TxnManager};
pub use state::{ElrMode, TxnState};
pub use txn::{CommitOutcome, SsxDeferSection, Txn, TxnDependent, UndoApplicator, UpdateGuard};
