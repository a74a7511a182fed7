//! The resource pool: lifecycle entry point for BerryDB.
//!
//! A [`Pool`] owns one page pool plus the set of open stores, all behind a
//! single engine lock. Page-pool operations run to completion before
//! another begins; callers that need concurrency above the pool serialize
//! externally. The lock is deliberately held across storage I/O so that no
//! pool invariant is observable mid-transition.

mod engine;

pub(crate) use engine::EngineState;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::page_pool::BufferId;
use crate::store::{Store, StoreOptions, log_file_path};
use crate::vfs::{BlockAccessFile, FileVfs, Vfs};

/// Largest supported page shift (1 MiB pages).
const MAX_PAGE_SHIFT: usize = 20;
/// Smallest supported page shift (8-byte pages, for native word access).
const MIN_PAGE_SHIFT: usize = 3;

/// Configuration for a resource pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Base-2 logarithm of the page size; pages are `1 << page_shift`
    /// bytes. Must lie in 3..=20.
    pub page_shift: usize,
    /// Maximum number of page buffers the pool will ever hold at once.
    pub page_pool_size: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            page_shift: 12, // 4KB pages
            page_pool_size: 1024,
        }
    }
}

impl PoolOptions {
    fn validate(&self) -> Result<()> {
        if self.page_shift < MIN_PAGE_SHIFT || self.page_shift > MAX_PAGE_SHIFT {
            return Err(Error::InvalidArgument(format!(
                "page_shift must be in {MIN_PAGE_SHIFT}..={MAX_PAGE_SHIFT}, got {}",
                self.page_shift
            )));
        }
        if self.page_pool_size == 0 {
            return Err(Error::InvalidArgument(
                "page_pool_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Shared engine: the VFS plus the lock-guarded mutable state.
pub(crate) struct PoolInner<V: Vfs> {
    pub(crate) vfs: V,
    page_shift: usize,
    page_pool_size: usize,
    pub(crate) state: Mutex<EngineState<V>>,
}

/// A resource pool.
///
/// Stores opened through one pool share its page pool and its VFS. The
/// handle is cheap to clone; [`Pool::release`] is the explicit teardown
/// point and closes every store the pool opened.
pub struct Pool<V: Vfs> {
    inner: Arc<PoolInner<V>>,
}

impl<V: Vfs> Clone for Pool<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Pool<FileVfs> {
    /// Creates a pool backed by the filesystem VFS.
    pub fn create(options: PoolOptions) -> Result<Self> {
        Self::with_vfs(options, FileVfs::new())
    }
}

// Opening a store and releasing the pool perform file I/O while holding the
// engine lock; see the module docs for why that is the intended model.
#[allow(clippy::await_holding_lock)]
impl<V: Vfs> Pool<V> {
    /// Creates a pool on top of an embedder-supplied VFS.
    pub fn with_vfs(options: PoolOptions, vfs: V) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                vfs,
                page_shift: options.page_shift,
                page_pool_size: options.page_pool_size,
                state: Mutex::new(EngineState::new(
                    options.page_shift,
                    options.page_pool_size,
                )),
            }),
        })
    }

    /// The pool's page size in bytes.
    pub fn page_size(&self) -> usize {
        1 << self.inner.page_shift
    }

    /// The pool's buffer capacity in pages.
    pub fn page_pool_size(&self) -> usize {
        self.inner.page_pool_size
    }

    /// Opens or creates the store at `path` and registers it with this
    /// pool.
    ///
    /// The data file is opened for block access and locked against other
    /// users; the companion log file is derived via
    /// [`log_file_path`] and created on demand.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] when `error_if_exists` is set without
    ///   `create_if_missing`, or after the pool was released.
    /// - [`Error::NotFound`] / [`Error::AlreadyExists`] per the option
    ///   flags.
    /// - [`Error::AlreadyLocked`] when another user holds the store's lock.
    pub async fn open_store(
        &self,
        path: impl AsRef<std::path::Path>,
        options: StoreOptions,
    ) -> Result<Store<V>> {
        let path = path.as_ref();
        if options.error_if_exists && !options.create_if_missing {
            return Err(Error::InvalidArgument(
                "error_if_exists requires create_if_missing".into(),
            ));
        }

        let mut state = self.inner.state.lock();
        if state.released {
            return Err(Error::InvalidArgument(
                "pool has been released".into(),
            ));
        }

        let (mut data_file, data_size) = self
            .inner
            .vfs
            .open_for_block_access(
                path,
                self.inner.page_shift,
                options.create_if_missing,
                options.error_if_exists,
            )
            .await?;

        if let Err(e) = data_file.lock() {
            let _ = data_file.close().await;
            return Err(e);
        }

        let page_size = 1u64 << self.inner.page_shift;
        if data_size % page_size != 0 {
            let _ = data_file.close().await;
            return Err(Error::Corrupted(format!(
                "data file size {data_size} is not a multiple of page size {page_size}"
            )));
        }

        let log_path = log_file_path(path);
        let (log_file, _log_size) = match self
            .inner
            .vfs
            .open_for_random_access(&log_path, true, false)
            .await
        {
            Ok(opened) => opened,
            Err(e) => {
                let _ = data_file.close().await;
                return Err(e);
            }
        };

        let id = state.register_store(path.to_path_buf(), data_file, log_file);
        debug!(store = %id, path = %path.display(), "store opened");

        Ok(Store {
            inner: Arc::clone(&self.inner),
            id,
        })
    }

    /// Releases the pool: closes every store it opened and tears down the
    /// page pool. All pins must have been dropped. Idempotent; further
    /// `open_store` calls are refused.
    ///
    /// Returns the first non-success status encountered while closing
    /// stores.
    pub async fn release(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.release().await
    }
}

/// A pinned page of a store.
///
/// Holding a `PinnedPage` keeps the buffer resident: the pool will neither
/// evict nor recycle it. Dropping the guard removes the pin; the buffer
/// then parks in the LRU list (still caching its page) or, if its binding
/// was discarded while pinned, in the free list.
///
/// Guards must be dropped before [`Pool::release`].
pub struct PinnedPage<V: Vfs> {
    pub(crate) inner: Arc<PoolInner<V>>,
    pub(crate) buffer: BufferId,
    pub(crate) page_id: u64,
}

impl<V: Vfs> PinnedPage<V> {
    /// The page id this buffer was fetched for.
    pub fn page_id(&self) -> u64 {
        self.page_id
    }

    /// Runs `f` over the page contents. The slice is exactly the pool's
    /// page size.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let state = self.inner.state.lock();
        f(state.page_pool.buffer(self.buffer).data())
    }

    /// Runs `f` over the mutable page contents.
    ///
    /// Mutating a page does not itself schedule a writeback: claim the page
    /// via [`crate::tx::Transaction::claim_page`] first, which marks it
    /// dirty. A page fetched with [`crate::page_pool::PageFetchMode::IgnoreData`]
    /// must be claimed before this guard is dropped.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut state = self.inner.state.lock();
        f(state.page_pool.buffer_mut(self.buffer).data_mut())
    }

    /// True while the buffer's contents differ from the on-disk page.
    pub fn is_dirty(&self) -> bool {
        let state = self.inner.state.lock();
        state.page_pool.buffer(self.buffer).is_dirty()
    }
}

impl<V: Vfs> Drop for PinnedPage<V> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if state.released {
            return;
        }
        if state.page_pool.buffer(self.buffer).owner().is_some() {
            state.page_pool.unpin_store_page(self.buffer);
        } else {
            state.page_pool.unpin_unassigned_page(self.buffer);
        }
    }
}
