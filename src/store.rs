//! Stores: one data file plus one log file, accessed through the page pool.
//!
//! A store never hands out raw file offsets; the pool asks it to read or
//! write whole pages by id, and the store maps page `i` to byte offset
//! `i << page_shift` in its data file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::page_pool::{PageBuffer, PageFetchMode};
use crate::pool::{PinnedPage, PoolInner};
use crate::tx::{Transaction, TxnId};
use crate::vfs::{BlockAccessFile, RandomAccessFile, Vfs};

/// Store identifier, unique within one resource pool.
///
/// Cached pages are keyed by (store id, page id); the id, not the handle's
/// address, is a store's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct StoreId(u64);

impl StoreId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options for opening a store.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    /// Create the data file if it does not exist.
    pub create_if_missing: bool,
    /// Refuse to open a pre-existing data file. Requires
    /// `create_if_missing`; both together mean "must create new".
    pub error_if_exists: bool,
}

/// Derives a store's log file path from its data file path.
///
/// Deterministic so embedders can locate (and delete) the companion file
/// during teardown.
pub fn log_file_path(data_path: &Path) -> PathBuf {
    let mut path = data_path.as_os_str().to_os_string();
    path.push(".log");
    PathBuf::from(path)
}

/// Per-store state tracked by the engine.
pub(crate) struct StoreState<V: Vfs> {
    path: PathBuf,
    /// Data file; `None` once the store is closed.
    data_file: Option<V::BlockFile>,
    /// Log file; `None` once the store is closed.
    log_file: Option<V::RandomFile>,
    page_shift: usize,
    /// The store's init transaction, which owns fetched-but-unclaimed
    /// pages. Lives until the store closes.
    pub(crate) init_txn: TxnId,
    /// Live user transactions opened on this store.
    pub(crate) txns: Vec<TxnId>,
    pub(crate) closed: bool,
}

impl<V: Vfs> StoreState<V> {
    pub(crate) fn new(
        path: PathBuf,
        data_file: V::BlockFile,
        log_file: V::RandomFile,
        page_shift: usize,
        init_txn: TxnId,
    ) -> Self {
        Self {
            path,
            data_file: Some(data_file),
            log_file: Some(log_file),
            page_shift,
            init_txn,
            txns: Vec::new(),
            closed: false,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the buffer's page from the data file into the buffer.
    pub(crate) async fn read_page(&mut self, buffer: &mut PageBuffer) -> Result<()> {
        debug_assert!(!buffer.is_dirty());
        let Some(file) = self.data_file.as_mut() else {
            return Err(Error::StoreClosed);
        };
        let offset = buffer.page_id() << self.page_shift;
        file.read(offset, buffer.data_mut()).await
    }

    /// Writes the buffer's page to the data file.
    pub(crate) async fn write_page(&mut self, buffer: &PageBuffer) -> Result<()> {
        debug_assert!(buffer.is_dirty());
        let Some(file) = self.data_file.as_mut() else {
            return Err(Error::StoreClosed);
        };
        let offset = buffer.page_id() << self.page_shift;
        file.write(buffer.data(), offset).await
    }

    /// Closes the file handles, releasing the advisory lock.
    pub(crate) async fn close_files(&mut self) -> Result<()> {
        let mut result = Ok(());
        if let Some(file) = self.data_file.take() {
            result = file.close().await;
        }
        if let Some(file) = self.log_file.take()
            && let Err(e) = file.close().await
            && result.is_ok()
        {
            result = Err(e);
        }
        result
    }
}

/// Handle to an open store.
///
/// Obtained from [`crate::pool::Pool::open_store`]. All page access goes
/// through the resource pool's page pool; the handle stays valid after the
/// store closes, at which point operations report
/// [`Error::StoreClosed`].
pub struct Store<V: Vfs> {
    pub(crate) inner: Arc<PoolInner<V>>,
    pub(crate) id: StoreId,
}

impl<V: Vfs> Clone for Store<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            id: self.id,
        }
    }
}

// Page fetches hold the engine lock across storage I/O; see the pool module.
#[allow(clippy::await_holding_lock)]
impl<V: Vfs> Store<V> {
    /// Begins a transaction against this store.
    pub fn begin_transaction(&self) -> Result<Transaction<V>> {
        let mut state = self.inner.state.lock();
        let id = state.begin_txn(self.id)?;
        Ok(Transaction {
            inner: Arc::clone(&self.inner),
            id,
        })
    }

    /// Fetches a page of this store, pinned.
    ///
    /// Returns the cached buffer when the page is resident; otherwise reads
    /// it into a free or evicted buffer ([`PageFetchMode::FetchData`]) or
    /// skips the read ([`PageFetchMode::IgnoreData`]). The pin is dropped
    /// when the returned [`PinnedPage`] goes out of scope.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolFull`] when every buffer in the pool is pinned.
    /// - [`Error::StoreClosed`] when this store has been closed.
    /// - [`Error::Io`] when the page read fails.
    pub async fn page(&self, page_id: u64, mode: PageFetchMode) -> Result<PinnedPage<V>> {
        let mut state = self.inner.state.lock();
        {
            let store = state
                .stores
                .get(&self.id)
                .ok_or(Error::StoreClosed)?;
            if store.closed {
                return Err(Error::StoreClosed);
            }
        }
        let buffer = state.store_page(self.id, page_id, mode).await?;
        Ok(PinnedPage {
            inner: Arc::clone(&self.inner),
            buffer,
            page_id,
        })
    }

    /// Closes the store.
    ///
    /// Live transactions are forced to rolled-back, the store's cached
    /// pages are released, and both files are closed. Closing an already
    /// closed store reports [`Error::StoreClosed`].
    pub async fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.close_store(self.id).await
    }

    /// True once the store has been closed.
    pub fn is_closed(&self) -> bool {
        let state = self.inner.state.lock();
        state.stores.get(&self.id).is_none_or(|s| s.closed)
    }

    /// The data file path this store was opened with.
    pub fn path(&self) -> PathBuf {
        let state = self.inner.state.lock();
        state.stores[&self.id].path().to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_path() {
        assert_eq!(
            log_file_path(Path::new("test.berry")),
            PathBuf::from("test.berry.log")
        );
        assert_eq!(
            log_file_path(Path::new("/data/stores/a.berry")),
            PathBuf::from("/data/stores/a.berry.log")
        );
        // No extension-stripping: the suffix is appended verbatim.
        assert_eq!(log_file_path(Path::new("plain")), PathBuf::from("plain.log"));
    }
}
