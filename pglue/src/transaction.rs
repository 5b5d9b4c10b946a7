//! Nested transactions via SAVEPOINTs: an ordered stack of `{tag, depth}`
//! entries. Depth 0 begins/ends with `BEGIN`/`COMMIT`/
//! `ROLLBACK`; depth > 0 uses `SAVEPOINT __pglue_tx` and friends. Looking
//! an entry up by its id (not its index) means an inner scope committing or
//! rolling back out of order is detected as "not open" rather than
//! silently truncating the wrong frame.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::PgResult;
use crate::wire::Wire;

/// A handle identifying one pushed frame; returned by [`TxStack::push`] and
/// consumed by [`TxStack::commit_sql`]/[`TxStack::rollback_sql`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxEntry {
    id: u64,
}

pub(crate) struct TxStack {
    next_id: u64,
    /// Innermost last; `depth` of an entry is its index here.
    entries: Vec<u64>,
}

impl TxStack {
    pub fn new() -> Self {
        TxStack { next_id: 0, entries: Vec::new() }
    }

    /// `BEGIN` at depth 0, `SAVEPOINT __pglue_tx` otherwise. Does not push —
    /// callers push only after the statement succeeds.
    pub fn begin_sql(&self) -> &'static str {
        if self.entries.is_empty() {
            "BEGIN"
        } else {
            "SAVEPOINT __pglue_tx"
        }
    }

    pub fn push(&mut self) -> TxEntry {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.push(id);
        TxEntry { id }
    }

    fn index_of(&self, entry: TxEntry) -> Option<usize> {
        self.entries.iter().position(|&id| id == entry.id)
    }

    /// `COMMIT` at depth 0, `RELEASE __pglue_tx` otherwise. Truncates the
    /// stack at `entry`'s index (removing it and anything nested above it
    /// that was never itself committed/rolled back). `None` if `entry` is
    /// no longer in the stack — reported as "transaction not open".
    pub fn commit_sql(&mut self, entry: TxEntry) -> Option<&'static str> {
        let idx = self.index_of(entry)?;
        self.entries.truncate(idx);
        Some(if idx == 0 { "COMMIT" } else { "RELEASE __pglue_tx" })
    }

    /// `ROLLBACK` at depth 0, `ROLLBACK TO __pglue_tx` + `RELEASE
    /// __pglue_tx` otherwise (the savepoint must be released after rolling
    /// back to it or it lingers for the rest of the outer transaction).
    pub fn rollback_sql(&mut self, entry: TxEntry) -> Option<Vec<&'static str>> {
        let idx = self.index_of(entry)?;
        self.entries.truncate(idx);
        Some(if idx == 0 { vec!["ROLLBACK"] } else { vec!["ROLLBACK TO __pglue_tx", "RELEASE __pglue_tx"] })
    }
}

/// A nested-transaction handle: commit, roll back, or let it drop (which
/// rolls back if still open).
pub struct Transaction {
    wire: Wire,
    entry: TxEntry,
    settled: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(wire: Wire, entry: TxEntry) -> Self {
        Transaction { wire, entry, settled: AtomicBool::new(false) }
    }

    pub async fn commit(self) -> PgResult<()> {
        self.settled.store(true, Ordering::SeqCst);
        self.wire.commit_entry(self.entry).await
    }

    pub async fn rollback(self) -> PgResult<()> {
        self.settled.store(true, Ordering::SeqCst);
        self.wire.rollback_entry(self.entry).await
    }

    pub fn wire(&self) -> &Wire {
        &self.wire
    }
}

impl Drop for Transaction {
    /// Best-effort auto-rollback: Rust has no async `Drop`, so a still-open
    /// transaction going out of scope spawns a detached rollback and logs a
    /// warning rather than blocking the dropping task.
    fn drop(&mut self) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        log::warn!("pglue: transaction dropped without commit/rollback; rolling back");
        let wire = self.wire.clone();
        let entry = self.entry;
        tokio::spawn(async move {
            if let Err(e) = wire.rollback_entry(entry).await {
                log::warn!("pglue: auto-rollback on drop failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_sql_is_begin_at_depth_zero_and_savepoint_when_nested() {
        let mut stack = TxStack::new();
        assert_eq!(stack.begin_sql(), "BEGIN");
        stack.push();
        assert_eq!(stack.begin_sql(), "SAVEPOINT __pglue_tx");
    }

    #[test]
    fn commit_outer_uses_commit_and_empties_stack() {
        let mut stack = TxStack::new();
        let outer = stack.push();
        assert_eq!(stack.commit_sql(outer), Some("COMMIT"));
        assert_eq!(stack.commit_sql(outer), None);
    }

    #[test]
    fn commit_nested_uses_release_and_keeps_outer_open() {
        let mut stack = TxStack::new();
        let outer = stack.push();
        let inner = stack.push();
        assert_eq!(stack.commit_sql(inner), Some("RELEASE __pglue_tx"));
        // outer is still open and its own commit now succeeds
        assert_eq!(stack.commit_sql(outer), Some("COMMIT"));
    }

    #[test]
    fn rollback_nested_releases_the_savepoint_too() {
        let mut stack = TxStack::new();
        let outer = stack.push();
        let inner = stack.push();
        assert_eq!(stack.rollback_sql(inner), Some(vec!["ROLLBACK TO __pglue_tx", "RELEASE __pglue_tx"]));
        assert_eq!(stack.rollback_sql(outer), Some(vec!["ROLLBACK"]));
    }

    #[test]
    fn rolling_back_an_outer_scope_drops_nested_entries_too() {
        let mut stack = TxStack::new();
        let outer = stack.push();
        let inner = stack.push();
        assert_eq!(stack.rollback_sql(outer), Some(vec!["ROLLBACK"]));
        assert_eq!(stack.commit_sql(inner), None);
    }
}
