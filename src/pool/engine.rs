//! Engine state: the page pool plus the store and transaction tables.
//!
//! Every operation that crosses component boundaries (fetch, eviction,
//! writeback, commit, close) is a method here, taking `&mut self` so the
//! whole transition is one uninterrupted walk over the engine state. The
//! only suspension points are the VFS calls reached through a store; no
//! pool invariant is mid-transition across them.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::page_pool::{BufferId, PageFetchMode, PagePool};
use crate::store::{StoreId, StoreState};
use crate::tx::{TxState, TxnId, TxnState};
use crate::vfs::Vfs;

pub(crate) struct EngineState<V: Vfs> {
    pub(crate) page_pool: PagePool,
    pub(crate) stores: HashMap<StoreId, StoreState<V>>,
    pub(crate) txns: HashMap<TxnId, TxnState>,
    next_store_id: u64,
    next_txn_id: u64,
    pub(crate) released: bool,
}

impl<V: Vfs> EngineState<V> {
    pub(crate) fn new(page_shift: usize, page_pool_size: usize) -> Self {
        Self {
            page_pool: PagePool::new(page_shift, page_pool_size),
            stores: HashMap::new(),
            txns: HashMap::new(),
            next_store_id: 1,
            next_txn_id: 1,
            released: false,
        }
    }

    // === Store and transaction registration ===

    pub(crate) fn register_store(
        &mut self,
        path: PathBuf,
        data_file: V::BlockFile,
        log_file: V::RandomFile,
    ) -> StoreId {
        let store_id = StoreId::new(self.next_store_id);
        self.next_store_id += 1;

        let init_txn = self.new_txn(store_id, true);
        let page_shift = self.page_pool.page_shift();
        self.stores.insert(
            store_id,
            StoreState::new(path, data_file, log_file, page_shift, init_txn),
        );
        store_id
    }

    fn new_txn(&mut self, store: StoreId, is_init: bool) -> TxnId {
        let id = TxnId::new(self.next_txn_id);
        self.next_txn_id += 1;
        self.txns.insert(id, TxnState::new(store, is_init));
        id
    }

    pub(crate) fn begin_txn(&mut self, store_id: StoreId) -> Result<TxnId> {
        let store = self
            .stores
            .get(&store_id)
            .ok_or(Error::StoreClosed)?;
        if store.closed {
            return Err(Error::StoreClosed);
        }

        let id = self.new_txn(store_id, false);
        self.stores.get_mut(&store_id).unwrap().txns.push(id);
        debug!(txn = %id, store = %store_id, "transaction started");
        Ok(id)
    }

    // === Page pool operations ===

    /// Returns a pinned buffer caching (store, page id).
    ///
    /// A cached page is re-pinned regardless of its prior state. A miss
    /// allocates, grows, or evicts; when none of those can produce a
    /// buffer, the request fails with [`Error::PoolFull`].
    pub(crate) async fn store_page(
        &mut self,
        store_id: StoreId,
        page_id: u64,
        fetch_mode: PageFetchMode,
    ) -> Result<BufferId> {
        if let Some(id) = self.page_pool.lookup(store_id, page_id) {
            debug_assert_eq!(self.page_pool.buffer(id).page_id(), page_id);
            self.page_pool.pin_store_page(id);
            return Ok(id);
        }

        let Some(id) = self.alloc_page().await else {
            return Err(Error::PoolFull);
        };

        match self
            .assign_page_to_store(id, store_id, page_id, fetch_mode)
            .await
        {
            Ok(()) => Ok(id),
            Err(e) => {
                self.page_pool.unpin_unassigned_page(id);
                Err(e)
            }
        }
    }

    /// Produces a pinned, unbound, clean buffer, or `None` when the pool is
    /// exhausted by pinned pages.
    ///
    /// Preference order: free list (LIFO), new allocation below capacity,
    /// then eviction of the LRU list's front. Evicting a dirty page writes
    /// it back to its store first; a writeback failure closes that store
    /// and is not surfaced here.
    pub(crate) async fn alloc_page(&mut self) -> Option<BufferId> {
        if let Some(id) = self.page_pool.alloc_ready() {
            return Some(id);
        }

        let victim = self.page_pool.lru_front()?;
        self.page_pool.lru_remove(victim);
        self.page_pool.pin(victim);
        self.unassign_page_from_store(victim).await;
        Some(victim)
    }

    /// Binds a freshly allocated buffer to (store, page id) under the
    /// store's init transaction and fetches its contents.
    pub(crate) async fn assign_page_to_store(
        &mut self,
        id: BufferId,
        store_id: StoreId,
        page_id: u64,
        fetch_mode: PageFetchMode,
    ) -> Result<()> {
        debug_assert!(self.page_pool.buffer(id).owner().is_none());

        let init_txn = self.stores[&store_id].init_txn;
        self.assign_page(init_txn, id, page_id);

        match self.fetch_store_page(id, store_id, fetch_mode).await {
            Ok(()) => {
                self.page_pool.map_insert(store_id, page_id, id);
                Ok(())
            }
            Err(e) => {
                self.unassign_page(id);
                Err(e)
            }
        }
    }

    async fn fetch_store_page(
        &mut self,
        id: BufferId,
        store_id: StoreId,
        fetch_mode: PageFetchMode,
    ) -> Result<()> {
        match fetch_mode {
            PageFetchMode::FetchData => {
                let store = self.stores.get_mut(&store_id).expect("store missing");
                store.read_page(self.page_pool.buffer_mut(id)).await
            }
            PageFetchMode::IgnoreData => {
                // The in-memory contents no longer match disk; the caller
                // must mark the page dirty before the next unpin. Fill with
                // recognizable garbage so uses of unwritten data stand out.
                #[cfg(debug_assertions)]
                self.page_pool.buffer_mut(id).data_mut().fill(0xCD);
                Ok(())
            }
        }
    }

    /// Destroys a buffer's binding, writing the page back first if dirty.
    ///
    /// A failed writeback is absorbed: the owning transaction is told to
    /// drop the page and the target store is closed, but the caller's own
    /// operation proceeds. The buffer ends pinned, clean, and unbound.
    pub(crate) async fn unassign_page_from_store(&mut self, id: BufferId) {
        let owner = self
            .page_pool
            .buffer(id)
            .owner()
            .expect("unassign of an unbound buffer");
        let page_id = self.page_pool.buffer(id).page_id();
        let store_id = self.txns[&owner].store;

        self.page_pool.map_remove(store_id, page_id);

        if self.page_pool.buffer(id).is_dirty() {
            let store = self.stores.get_mut(&store_id).expect("store missing");
            match store.write_page(self.page_pool.buffer(id)).await {
                Ok(()) => self.unassign_persisted_page(id),
                Err(e) => {
                    warn!(
                        store = %store_id, page = page_id, error = %e,
                        "writeback failed during eviction, closing store"
                    );
                    self.unassign_page(id);
                    let _ = self.close_store(store_id).await;
                }
            }
        } else {
            self.unassign_page(id);
        }
    }

    /// Re-pins every page owned by a transaction, for the duration of a
    /// commit.
    pub(crate) fn pin_transaction_pages(&mut self, txn_id: TxnId) {
        let mut cursor = self.txns[&txn_id].pages.front();
        while let Some(id) = cursor {
            cursor = self.txns[&txn_id]
                .pages
                .next_of(self.page_pool.arena(), id);
            self.page_pool.pin_store_page(id);
        }
    }

    // === Transaction page-list callbacks ===

    /// Adds a buffer to a transaction's page list and binds it.
    fn assign_page(&mut self, txn_id: TxnId, id: BufferId, page_id: u64) {
        let txn = self.txns.get_mut(&txn_id).expect("transaction missing");
        txn.pages.push_back(self.page_pool.arena_mut(), id);
        self.page_pool.buffer_mut(id).bind(txn_id, page_id);
    }

    /// Removes a buffer from its transaction and clears the binding,
    /// discarding the cached contents. Used when the contents do not need
    /// to be preserved: clean pages, rollbacks, and failed writebacks.
    fn unassign_page(&mut self, id: BufferId) {
        let owner = self
            .page_pool
            .buffer(id)
            .owner()
            .expect("unassign of an unbound buffer");
        let txn = self.txns.get_mut(&owner).expect("transaction missing");
        txn.pages.remove(self.page_pool.arena_mut(), id);
        self.page_pool.log_list_remove(id);

        let buffer = self.page_pool.buffer_mut(id);
        buffer.mark_clean();
        buffer.unbind();
    }

    /// Like `unassign_page`, for a buffer whose contents were just written
    /// back successfully; the dirty flag is cleared because memory and disk
    /// agree again.
    fn unassign_persisted_page(&mut self, id: BufferId) {
        debug_assert!(self.page_pool.buffer(id).is_dirty());
        self.unassign_page(id);
    }

    /// Moves a modified, pinned page from the store's init transaction to
    /// `txn_id` and marks it dirty. The page enters the log-dirty list; it
    /// stays there until it is persisted or discarded.
    pub(crate) fn claim_page(&mut self, txn_id: TxnId, id: BufferId) -> Result<()> {
        let txn = self.txns.get(&txn_id).expect("transaction missing");
        if txn.state.is_closed() {
            return Err(Error::TransactionClosed);
        }
        let store_id = txn.store;
        debug_assert!(!self.page_pool.buffer(id).is_unpinned());

        let owner = self
            .page_pool
            .buffer(id)
            .owner()
            .ok_or_else(|| Error::InvalidArgument("page is not bound to a store".into()))?;

        if owner != txn_id {
            let owner_state = &self.txns[&owner];
            if owner_state.store != store_id || !owner_state.is_init {
                return Err(Error::InvalidArgument(
                    "page is owned by another transaction".into(),
                ));
            }
            self.txns
                .get_mut(&owner)
                .unwrap()
                .pages
                .remove(self.page_pool.arena_mut(), id);
            self.txns
                .get_mut(&txn_id)
                .unwrap()
                .pages
                .push_back(self.page_pool.arena_mut(), id);
            self.page_pool.buffer_mut(id).rebind(txn_id);
        }

        self.page_pool.buffer_mut(id).mark_dirty();
        self.page_pool.log_list_push(id);
        Ok(())
    }

    /// Hands a just-persisted page back to its store's init transaction and
    /// clears the dirty flag. The page stays cached.
    fn page_was_persisted(&mut self, id: BufferId) {
        let owner = self
            .page_pool
            .buffer(id)
            .owner()
            .expect("persisted page must be bound");
        let store_id = self.txns[&owner].store;
        let init_txn = self.stores[&store_id].init_txn;
        debug_assert_ne!(owner, init_txn);

        self.txns
            .get_mut(&owner)
            .unwrap()
            .pages
            .remove(self.page_pool.arena_mut(), id);
        self.txns
            .get_mut(&init_txn)
            .unwrap()
            .pages
            .push_back(self.page_pool.arena_mut(), id);

        self.page_pool.buffer_mut(id).rebind(init_txn);
        self.page_pool.buffer_mut(id).mark_clean();
        self.page_pool.log_list_remove(id);
    }

    // === Transaction lifecycle ===

    pub(crate) async fn commit_txn(&mut self, txn_id: TxnId) -> Result<()> {
        let txn = self.txns.get(&txn_id).expect("transaction missing");
        if txn.state.is_closed() {
            return Err(Error::TransactionClosed);
        }
        debug_assert!(!txn.is_init);
        let store_id = txn.store;

        // Keep every page of this transaction resident until it is
        // persisted.
        self.pin_transaction_pages(txn_id);
        let pinned = self.txn_page_ids(txn_id);

        // Pages with outstanding log records are persisted in the order
        // they entered the log-dirty list.
        let mut to_persist = Vec::new();
        let mut cursor = self.page_pool.log_list_front();
        while let Some(id) = cursor {
            cursor = self.page_pool.log_list_next(id);
            if self.page_pool.buffer(id).owner() == Some(txn_id) {
                to_persist.push(id);
            }
        }

        let mut write_error = None;
        for id in to_persist {
            debug_assert!(self.page_pool.buffer(id).is_dirty());
            let store = self.stores.get_mut(&store_id).expect("store missing");
            match store.write_page(self.page_pool.buffer(id)).await {
                Ok(()) => self.page_was_persisted(id),
                Err(e) => {
                    write_error = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = write_error {
            warn!(txn = %txn_id, store = %store_id, error = %e, "commit writeback failed");
            self.force_rollback(txn_id);
            for id in pinned {
                self.unpin_any(id);
            }
            let _ = self.close_store(store_id).await;
            return Err(e);
        }

        for id in pinned {
            self.unpin_any(id);
        }

        self.txns.get_mut(&txn_id).unwrap().state = TxState::Committed;
        self.store_transaction_closed(store_id, txn_id);
        debug!(txn = %txn_id, store = %store_id, "transaction committed");
        Ok(())
    }

    pub(crate) fn rollback_txn(&mut self, txn_id: TxnId) -> Result<()> {
        let txn = self.txns.get(&txn_id).expect("transaction missing");
        if txn.state.is_closed() {
            return Err(Error::TransactionClosed);
        }
        self.force_rollback(txn_id);
        Ok(())
    }

    fn force_rollback(&mut self, txn_id: TxnId) {
        debug_assert_eq!(self.txns[&txn_id].state, TxState::Active);
        let store_id = self.txns[&txn_id].store;

        self.discard_transaction_pages(txn_id);
        self.txns.get_mut(&txn_id).unwrap().state = TxState::RolledBack;
        self.store_transaction_closed(store_id, txn_id);
        debug!(txn = %txn_id, store = %store_id, "transaction rolled back");
    }

    /// Discards every page a transaction owns: the binding is erased and
    /// unpinned buffers move to the free list. Dirty contents are dropped,
    /// not written back.
    fn discard_transaction_pages(&mut self, txn_id: TxnId) {
        let store_id = self.txns[&txn_id].store;
        let mut cursor = self.txns[&txn_id].pages.front();
        while let Some(id) = cursor {
            cursor = self.txns[&txn_id]
                .pages
                .next_of(self.page_pool.arena(), id);

            let page_id = self.page_pool.buffer(id).page_id();
            self.page_pool.map_remove(store_id, page_id);

            let was_unpinned = self.page_pool.buffer(id).is_unpinned();
            if was_unpinned {
                self.page_pool.lru_remove(id);
            }
            self.unassign_page(id);
            if was_unpinned {
                self.page_pool.push_free(id);
            }
        }
        debug_assert!(self.txns[&txn_id].pages.is_empty());
    }

    fn store_transaction_closed(&mut self, store_id: StoreId, txn_id: TxnId) {
        if let Some(store) = self.stores.get_mut(&store_id)
            && !store.closed
        {
            store.txns.retain(|&t| t != txn_id);
        }
    }

    fn txn_page_ids(&self, txn_id: TxnId) -> Vec<BufferId> {
        let mut ids = Vec::new();
        let mut cursor = self.txns[&txn_id].pages.front();
        while let Some(id) = cursor {
            cursor = self.txns[&txn_id]
                .pages
                .next_of(self.page_pool.arena(), id);
            ids.push(id);
        }
        ids
    }

    fn unpin_any(&mut self, id: BufferId) {
        if self.page_pool.buffer(id).owner().is_some() {
            self.page_pool.unpin_store_page(id);
        } else {
            self.page_pool.unpin_unassigned_page(id);
        }
    }

    // === Store lifecycle ===

    /// Closes a store: forces its live transactions to rolled-back,
    /// releases its cached pages, and closes both files.
    ///
    /// Returns the first non-success status encountered.
    pub(crate) async fn close_store(&mut self, store_id: StoreId) -> Result<()> {
        let store = self
            .stores
            .get_mut(&store_id)
            .ok_or(Error::StoreClosed)?;
        if store.closed {
            return Err(Error::StoreClosed);
        }
        store.closed = true;

        let user_txns = std::mem::take(&mut store.txns);
        let init_txn = store.init_txn;

        for txn_id in user_txns {
            if self.txns[&txn_id].state == TxState::Active {
                warn!(txn = %txn_id, store = %store_id, "store closing, rolling back transaction");
                self.force_rollback(txn_id);
            }
        }

        // Roll back the init transaction to release the store's remaining
        // cached pages.
        self.discard_transaction_pages(init_txn);
        self.txns.get_mut(&init_txn).unwrap().state = TxState::RolledBack;

        let result = self
            .stores
            .get_mut(&store_id)
            .unwrap()
            .close_files()
            .await;
        debug!(store = %store_id, "store closed");
        result
    }

    /// Tears the pool down: closes every open store, then releases every
    /// buffer. Returns the first non-success status from the closes.
    pub(crate) async fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut result = Ok(());
        let store_ids: Vec<StoreId> = self.stores.keys().copied().collect();
        for store_id in store_ids {
            if !self.stores[&store_id].closed
                && let Err(e) = self.close_store(store_id).await
                && result.is_ok()
            {
                result = Err(e);
            }
        }

        self.page_pool.teardown();
        debug!("pool released");
        result
    }
}
