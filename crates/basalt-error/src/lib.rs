//! Primary error type for basalt operations.
//!
//! Three of the variants are *expected outcomes* rather than faults:
//! [`LatchQFail`](BasaltError::LatchQFail) and
//! [`ParentLatchQFail`](BasaltError::ParentLatchQFail) tell the caller to
//! retry with a stronger latch, and [`WouldBlock`](BasaltError::WouldBlock)
//! reports a conditional acquisition that could not proceed. Callers check
//! these with the predicates below and never log them as errors.

use basalt_types::{FrameId, Lsn, PageId, StoreId, TxnId, VolumeId};
use thiserror::Error;

/// Error type for every fallible basalt operation.
#[derive(Error, Debug)]
pub enum BasaltError {
    // === Optimistic / conditional outcomes ===
    /// An optimistic (Q-mode) page access could not be granted or did not
    /// validate. Retry with a stronger latch mode.
    #[error("optimistic latch failed on page {pid} (retry with a stronger mode)")]
    LatchQFail { pid: PageId },

    /// The parent was held in Q mode and changed observably while the child
    /// was being fixed. Retry the whole descent with a stronger latch.
    #[error("parent changed under optimistic latch while fixing page {pid}")]
    ParentLatchQFail { pid: PageId },

    /// A conditional latch or lock acquisition would have had to block.
    #[error("would block: {what}")]
    WouldBlock { what: &'static str },

    // === Fix-path contract violations ===
    /// `fix_direct` was handed a swizzled pointer; without the parent latched
    /// the referenced frame may no longer hold the intended page.
    #[error("direct fix rejects swizzled pointer {pid}")]
    DirectFixSwizzledPointer { pid: PageId },

    /// The requested frame was evicted or recycled under the caller.
    #[error("frame {frame} no longer holds the expected page")]
    FrameGone { frame: FrameId },

    // === Resource exhaustion ===
    /// The log reservation ledger cannot grant more space.
    #[error("out of log space: requested {requested} bytes")]
    OutOfLogSpace { requested: u64 },

    /// No free frame was available and eviction was not permitted or failed.
    #[error("buffer pool free list exhausted")]
    FreelistExhausted,

    /// Every store id on the volume's store-node page is in use.
    #[error("no unused store id on volume {vol}")]
    StoreExhausted { vol: VolumeId },

    // === Page integrity ===
    /// A page image failed its checksum and single-page recovery could not
    /// rebuild it.
    #[error("page {vol}:{pid} unreadable: {detail}")]
    ReadFailed { vol: VolumeId, pid: PageId, detail: String },

    /// The per-page log chain does not line up with the image on disk.
    #[error("page {pid} log chain broken: expected lsn <= {expected}, found {found}")]
    WrongPageLsnChain { pid: PageId, expected: Lsn, found: Lsn },

    // === Transactions ===
    /// Lock acquisition gave up: the wait graph has a cycle, or the
    /// transaction was poisoned by `force_nonblocking`.
    #[error("deadlock: transaction {txn} aborted a lock wait")]
    Deadlock { txn: TxnId },

    /// A lock or space wait exceeded the transaction's timeout.
    #[error("timeout after {millis} ms")]
    Timeout { millis: u64 },

    /// An operation was attempted in a transaction state that forbids it.
    #[error("invalid transaction state: {detail}")]
    InvalidTxnState { detail: String },

    /// Mixed early-lock-release modes across interacting transactions.
    #[error("early lock release mode mismatch: engine is {engine:?}, transaction asked {asked:?}")]
    ElrModeMismatch { engine: &'static str, asked: &'static str },

    // === Catalog ===
    /// The store does not exist (root page id is 0).
    #[error("no such store {store} on volume {vol}")]
    NoSuchStore { vol: VolumeId, store: StoreId },

    // === Infrastructure ===
    /// Write-order dependency registration was refused (cycle, or the
    /// dependency target is already clean).
    #[error("write-order dependency rejected: {detail}")]
    DependencyRejected { detail: &'static str },

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Broken internal invariant. In debug builds most of these are caught
    /// by assertions first.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BasaltError {
    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for the two optimistic-latch outcomes. These never surface above
    /// the page handle: the caller retries with a stronger latch mode.
    #[must_use]
    pub const fn is_optimistic_fail(&self) -> bool {
        matches!(self, Self::LatchQFail { .. } | Self::ParentLatchQFail { .. })
    }

    /// True when a conditional (non-blocking) request could not proceed.
    #[must_use]
    pub const fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock { .. })
    }

    /// True for outcomes that may succeed if simply retried later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LatchQFail { .. }
                | Self::ParentLatchQFail { .. }
                | Self::WouldBlock { .. }
                | Self::FreelistExhausted
                | Self::Timeout { .. }
        )
    }

    /// True for errors that must abort the enclosing transaction.
    #[must_use]
    pub const fn aborts_txn(&self) -> bool {
        matches!(
            self,
            Self::Deadlock { .. } | Self::OutOfLogSpace { .. } | Self::ReadFailed { .. }
        )
    }
}

/// Result alias using [`BasaltError`].
pub type Result<T> = std::result::Result<T, BasaltError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimistic_predicates() {
        let q = BasaltError::LatchQFail { pid: PageId::new(4) };
        let pq = BasaltError::ParentLatchQFail { pid: PageId::new(4) };
        assert!(q.is_optimistic_fail());
        assert!(pq.is_optimistic_fail());
        assert!(q.is_transient());
        assert!(!q.is_would_block());
        assert!(!BasaltError::FreelistExhausted.is_optimistic_fail());
    }

    #[test]
    fn would_block_is_conditional_only() {
        let e = BasaltError::WouldBlock { what: "frame latch" };
        assert!(e.is_would_block());
        assert!(e.is_transient());
        assert!(!e.aborts_txn());
    }

    #[test]
    fn abort_class() {
        assert!(BasaltError::Deadlock { txn: TxnId::new(7) }.aborts_txn());
        assert!(BasaltError::OutOfLogSpace { requested: 512 }.aborts_txn());
        assert!(!BasaltError::FreelistExhausted.aborts_txn());
    }

    #[test]
    fn display_carries_context() {
        let e = BasaltError::WrongPageLsnChain {
            pid: PageId::new(11),
            expected: Lsn::new(1, 64),
            found: Lsn::new(1, 128),
        };
        let text = e.to_string();
        assert!(text.contains("11"));
        assert!(text.contains("1.64"));
    }

    #[test]
    fn io_error_from() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing partition");
        let e: BasaltError = io.into();
        assert!(matches!(e, BasaltError::Io(_)));
    }
}
