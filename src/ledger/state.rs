//! Item lifecycle states

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of an item in the ledger. Declaration order is the
/// storage ordinal and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemState {
    Undefined,
    Pending,
    PendingPositive,
    PendingNegative,
    Approved,
    /// Approved, and held by a pending revision that revokes it.
    Locked,
    Declined,
    Revoked,
    Discarded,
    /// Provisionally reserved by a pending item that creates it.
    LockedForCreation,
}

struct Traits {
    pending: bool,
    approved: bool,
    terminal: bool,
    locked: bool,
}

impl ItemState {
    pub const ALL: [ItemState; 10] = [
        ItemState::Undefined,
        ItemState::Pending,
        ItemState::PendingPositive,
        ItemState::PendingNegative,
        ItemState::Approved,
        ItemState::Locked,
        ItemState::Declined,
        ItemState::Revoked,
        ItemState::Discarded,
        ItemState::LockedForCreation,
    ];

    const fn traits(self) -> Traits {
        const fn t(pending: bool, approved: bool, terminal: bool, locked: bool) -> Traits {
            Traits { pending, approved, terminal, locked }
        }
        match self {
            ItemState::Undefined => t(false, false, false, false),
            ItemState::Pending => t(true, false, false, false),
            ItemState::PendingPositive => t(true, false, false, false),
            ItemState::PendingNegative => t(true, false, false, false),
            ItemState::Approved => t(false, true, true, false),
            ItemState::Locked => t(false, true, false, true),
            ItemState::Declined => t(false, false, true, false),
            ItemState::Revoked => t(false, false, true, false),
            ItemState::Discarded => t(false, false, true, false),
            ItemState::LockedForCreation => t(true, false, false, true),
        }
    }

    pub const fn is_pending(self) -> bool {
        self.traits().pending
    }

    pub const fn is_approved(self) -> bool {
        self.traits().approved
    }

    pub const fn is_terminal(self) -> bool {
        self.traits().terminal
    }

    pub const fn is_locked(self) -> bool {
        self.traits().locked
    }

    /// Whether the ledger may move a record from `self` to `next`.
    pub fn can_transition_to(self, next: ItemState) -> bool {
        use ItemState::*;
        if self == next {
            return true;
        }
        match self {
            Undefined => next != Undefined,
            Pending | PendingPositive | PendingNegative => {
                matches!(next, PendingPositive | PendingNegative) || next.is_terminal()
            }
            Approved => matches!(next, Locked | Revoked),
            Locked => matches!(next, Approved | Revoked),
            LockedForCreation => matches!(next, Approved | Undefined),
            Declined | Revoked | Discarded => false,
        }
    }

    pub fn ordinal(self) -> i64 {
        self as i64
    }

    pub fn from_ordinal(ordinal: i64) -> Option<Self> {
        usize::try_from(ordinal).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Undefined => "UNDEFINED",
            ItemState::Pending => "PENDING",
            ItemState::PendingPositive => "PENDING_POSITIVE",
            ItemState::PendingNegative => "PENDING_NEGATIVE",
            ItemState::Approved => "APPROVED",
            ItemState::Locked => "LOCKED",
            ItemState::Declined => "DECLINED",
            ItemState::Revoked => "REVOKED",
            ItemState::Discarded => "DISCARDED",
            ItemState::LockedForCreation => "LOCKED_FOR_CREATION",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown item state: {}", s))
    }
}
