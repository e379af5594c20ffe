//! Transaction states and the early-lock-release policy.

use basalt_error::{BasaltError, Result};

/// Lifecycle of a transaction.
///
/// `Active -> (Aborting | Committing) -> FreeingSpace -> Ended`, with
/// `Prepared` reachable from `Active` for two-phase coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum TxnState {
    Active,
    Prepared,
    Aborting,
    Committing,
    FreeingSpace,
    Ended,
}

impl TxnState {
    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Prepared)
                | (Self::Active | Self::Prepared, Self::Committing | Self::Aborting)
                | (Self::Committing | Self::Aborting, Self::FreeingSpace)
                | (Self::FreeingSpace, Self::Ended)
        )
    }

    /// Validate and apply a transition.
    pub fn transition(self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(BasaltError::InvalidTxnState {
                detail: format!("{self:?} -> {next:?}"),
            })
        }
    }

    /// The transaction has finished (no further log records or locks).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ended)
    }
}

/// Early lock release mode. Must be uniform across every transaction that
/// could interact; the transaction manager enforces this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
pub enum ElrMode {
    /// Standard two-phase locking: all locks held until log-durable.
    #[default]
    None,
    /// Release shared, update, and intent locks at pre-commit; exclusive
    /// locks wait for durability.
    S,
    /// Release all locks at pre-commit. Readers that depended on this
    /// transaction stall at their own commit until the log is durable up to
    /// the releaser's tag.
    Sx,
    /// Keep locks but permit violations; the watermark check is the same as
    /// [`Sx`](Self::Sx). Readers of violated locks self-stall identically.
    Clv,
}

impl ElrMode {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::S => "s",
            Self::Sx => "sx",
            Self::Clv => "clv",
        }
    }

    /// Whether read-only transactions must honor the read watermark at
    /// commit.
    #[must_use]
    pub const fn readers_check_watermark(self) -> bool {
        matches!(self, Self::Sx | Self::Clv)
    }
}
