//! Transactions.
//!
//! A transaction owns the set of pool pages it has modified and is the
//! target of the page pool's unassignment callbacks. Every store also holds
//! one init transaction for its own lifetime; the pool binds freshly
//! fetched pages to it until a user transaction claims them.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::page_pool::{BufferList, TxnSlot};
use crate::pool::{PinnedPage, PoolInner};
use crate::store::StoreId;
use crate::vfs::Vfs;

/// Transaction identifier, unique within one resource pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TxnId(u64);

impl TxnId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction lifecycle states.
///
/// `Active` transitions to exactly one of the terminal states; both
/// terminal states imply the transaction is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxState {
    Active,
    Committed,
    RolledBack,
}

impl TxState {
    pub(crate) fn is_closed(self) -> bool {
        self != TxState::Active
    }
}

/// Per-transaction state tracked by the engine.
pub(crate) struct TxnState {
    /// The store this transaction runs against.
    pub(crate) store: StoreId,
    pub(crate) state: TxState,
    /// Init transactions hold pages fetched on a pool miss before any user
    /// transaction claims them; they live as long as their store.
    pub(crate) is_init: bool,
    /// Pages currently owned by this transaction. The list links live in
    /// the pool's buffers.
    pub(crate) pages: BufferList<TxnSlot>,
}

impl TxnState {
    pub(crate) fn new(store: StoreId, is_init: bool) -> Self {
        Self {
            store,
            state: TxState::Active,
            is_init,
            pages: BufferList::new(),
        }
    }
}

/// Handle to a transaction.
///
/// Obtained from [`crate::store::Store::begin_transaction`]. The handle
/// stays valid after the transaction reaches a terminal state, so its
/// outcome can still be observed; closing a store forces its live
/// transactions to rolled-back.
pub struct Transaction<V: Vfs> {
    pub(crate) inner: Arc<PoolInner<V>>,
    pub(crate) id: TxnId,
}

impl<V: Vfs> Clone for Transaction<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            id: self.id,
        }
    }
}

// The engine lock is held across writeback I/O on the commit path, the same
// way the pool's other I/O-bearing operations hold it.
#[allow(clippy::await_holding_lock)]
impl<V: Vfs> Transaction<V> {
    /// True once the transaction has committed.
    pub fn is_committed(&self) -> bool {
        self.state() == TxState::Committed
    }

    /// True once the transaction has rolled back, voluntarily or because
    /// its store closed.
    pub fn is_rolled_back(&self) -> bool {
        self.state() == TxState::RolledBack
    }

    /// True once the transaction has reached either terminal state.
    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Declares that this transaction is about to modify a pinned page.
    ///
    /// The page moves from the store's init transaction to this one and is
    /// marked dirty; its writeback is now this transaction's to schedule
    /// (at commit, or earlier if the pool evicts it).
    pub fn claim_page(&self, page: &PinnedPage<V>) -> Result<()> {
        if !Arc::ptr_eq(&self.inner, &page.inner) {
            return Err(crate::error::Error::InvalidArgument(
                "page belongs to a different pool".into(),
            ));
        }
        self.inner.state.lock().claim_page(self.id, page.buffer)
    }

    /// Commits the transaction.
    ///
    /// Pins the transaction's pages, writes the dirty ones back to the
    /// store in log order, hands them to the init transaction, and marks
    /// the transaction committed. A write failure rolls the transaction
    /// back, closes the store, and surfaces the error.
    pub async fn commit(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.commit_txn(self.id).await
    }

    /// Rolls the transaction back, discarding its cached modifications.
    pub async fn rollback(&self) -> Result<()> {
        self.inner.state.lock().rollback_txn(self.id)
    }

    fn state(&self) -> TxState {
        let state = self.inner.state.lock();
        state.txns[&self.id].state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_terminal_states() {
        assert!(!TxState::Active.is_closed());
        assert!(TxState::Committed.is_closed());
        assert!(TxState::RolledBack.is_closed());
    }

    #[test]
    fn test_new_txn_state() {
        let txn = TxnState::new(StoreId::new(1), false);
        assert_eq!(txn.state, TxState::Active);
        assert!(!txn.is_init);
        assert!(txn.pages.is_empty());
    }
}
