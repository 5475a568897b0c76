use crate::model::{LedgerAction, LedgerEntry};
use std::fmt;

/// Whose balance a ledger entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Account {
    Client(u64),
    User(u64),
}

impl Account {
    pub fn id(&self) -> u64 {
        match self {
            Account::Client(id) | Account::User(id) => *id,
        }
    }

    /// Storage prefix: one tag byte followed by the big-endian owner id.
    pub fn key(&self) -> [u8; 9] {
        let (tag, id) = match self {
            Account::Client(id) => (b'c', *id),
            Account::User(id) => (b'u', *id),
        };
        let mut out = [0u8; 9];
        out[0] = tag;
        out[1..].copy_from_slice(&id.to_be_bytes());
        out
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Account::Client(id) => write!(f, "client:{id}"),
            Account::User(id) => write!(f, "user:{id}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{0} has no initial entry")]
    MissingBaseline(String),

    #[error("{0} already has an initial entry")]
    BaselineExists(String),

    #[error("balance of {0} would overflow")]
    Overflow(String),

    #[error("corrupt ledger record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Filter and page for ledger listings. Times are inclusive, in ms.
#[derive(Debug, Clone)]
pub struct LedgerQuery {
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
    /// Zero-based page index.
    pub page: usize,
    pub page_size: usize,
}

impl Default for LedgerQuery {
    fn default() -> Self {
        Self {
            start_ms: None,
            end_ms: None,
            page: 0,
            page_size: 50,
        }
    }
}

impl LedgerQuery {
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.start_ms.map_or(true, |s| entry.created_at_ms >= s)
            && self.end_ms.map_or(true, |e| entry.created_at_ms <= e)
    }
}

/// Append-only balance history per account.
///
/// `append` must read the latest entry and write the next one as a single
/// linearizable step per account; concurrent appends never observe the same
/// predecessor.
pub trait Ledger: Send + Sync {
    fn append(
        &self,
        account: Account,
        change: i64,
        action: LedgerAction,
        reason: &str,
    ) -> Result<LedgerEntry, LedgerError>;

    /// Remaining balance after the latest entry, `None` before the baseline exists.
    fn balance(&self, account: Account) -> Result<Option<i64>, LedgerError>;

    /// Entries in append order.
    fn entries(&self, account: Account, query: &LedgerQuery) -> Result<Vec<LedgerEntry>, LedgerError>;
}

/// Builds the entry that follows `prev`, enforcing the baseline rules.
pub fn next_entry(
    account: Account,
    prev: Option<(u64, i64)>,
    id: u64,
    change: i64,
    action: LedgerAction,
    reason: &str,
    now_ms: u64,
) -> Result<LedgerEntry, LedgerError> {
    let (seq, remaining) = match (prev, action) {
        (None, LedgerAction::Initial) => (1, change),
        (None, _) => return Err(LedgerError::MissingBaseline(account.to_string())),
        (Some(_), LedgerAction::Initial) => {
            return Err(LedgerError::BaselineExists(account.to_string()))
        }
        (Some((seq, remaining)), _) => match remaining.checked_add(change) {
            Some(next) => (seq + 1, next),
            None => return Err(LedgerError::Overflow(account.to_string())),
        },
    };
    Ok(LedgerEntry {
        id,
        owner_id: account.id(),
        seq,
        change,
        remaining,
        action,
        reason: reason.to_string(),
        created_at_ms: now_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_entry_must_be_initial() {
        let acc = Account::User(3);
        let err = next_entry(acc, None, 1, -5, LedgerAction::Consumption, "", 0).unwrap_err();
        assert!(matches!(err, LedgerError::MissingBaseline(ref s) if s == "user:3"));

        let base = next_entry(acc, None, 1, 0, LedgerAction::Initial, "", 0).unwrap();
        assert_eq!((base.seq, base.remaining), (1, 0));
    }

    #[test]
    fn follows_previous_snapshot() {
        let acc = Account::Client(9);
        let e = next_entry(acc, Some((4, 100)), 12, -30, LedgerAction::Consumption, "x", 7).unwrap();
        assert_eq!(e.seq, 5);
        assert_eq!(e.remaining, 70);
        assert_eq!(e.owner_id, 9);

        let dup = next_entry(acc, Some((4, 100)), 13, 0, LedgerAction::Initial, "", 7);
        assert!(matches!(dup, Err(LedgerError::BaselineExists(_))));
    }

    #[test]
    fn overflowing_change_is_refused() {
        let acc = Account::User(2);
        let err = next_entry(acc, Some((1, i64::MAX - 1)), 2, 2, LedgerAction::Recharge, "", 0).unwrap_err();
        assert!(matches!(err, LedgerError::Overflow(ref s) if s == "user:2"));
        let err = next_entry(acc, Some((1, i64::MIN)), 2, -1, LedgerAction::Special, "", 0).unwrap_err();
        assert!(matches!(err, LedgerError::Overflow(_)));
    }

    #[test]
    fn account_keys_do_not_collide() {
        assert_ne!(Account::Client(1).key(), Account::User(1).key());
        assert_eq!(&Account::User(1).key()[1..], &1u64.to_be_bytes());
    }
}
