//! Platform file services.
//!
//! The VFS is the only place BerryDB touches the filesystem. Stores open
//! their data file through [`Vfs::open_for_block_access`] and their log file
//! through [`Vfs::open_for_random_access`]; everything above the VFS speaks
//! in whole pages and log records.
//!
//! Two implementations are provided:
//! - [`FileVfs`]: tokio-fs backed, the default.
//! - [`MemoryVfs`]: in-memory files for tests and ephemeral workloads.
//!
//! Embedders can supply their own implementation of the three traits.

mod file;
mod memory;

pub use file::FileVfs;
pub use memory::{MemoryFile, MemoryVfs};

use std::future::Future;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::Result;

/// Platform service interface.
///
/// The name "Vfs" was chosen because most of the services revolve around
/// file access. Implementations must be cheap to share by reference; the
/// blanket `impl Vfs for &V` below lets a process-wide instance such as
/// [`default_vfs`] be plugged into a pool directly.
pub trait Vfs: Send + Sync {
    /// File handle type produced by [`Vfs::open_for_random_access`].
    type RandomFile: RandomAccessFile;
    /// File handle type produced by [`Vfs::open_for_block_access`].
    type BlockFile: BlockAccessFile;

    /// Opens a file without any assumptions on the I/O access pattern.
    ///
    /// This is used for transaction logs. Returns the handle and the number
    /// of bytes in the file at open time; the caller is responsible for
    /// tracking size changes it causes afterwards.
    ///
    /// `error_if_exists` refuses to open a pre-existing file and requires
    /// `create_if_missing` to also be set.
    fn open_for_random_access(
        &self,
        path: &Path,
        create_if_missing: bool,
        error_if_exists: bool,
    ) -> impl Future<Output = Result<(Self::RandomFile, u64)>> + Send;

    /// Opens a file designed for reads and writes at block granularity.
    ///
    /// This is used for store data files. `block_shift` guarantees that all
    /// transfers are aligned to the 1 << `block_shift` block size, so
    /// implementations may bypass user-space buffering.
    fn open_for_block_access(
        &self,
        path: &Path,
        block_shift: usize,
        create_if_missing: bool,
        error_if_exists: bool,
    ) -> impl Future<Output = Result<(Self::BlockFile, u64)>> + Send;

    /// Deletes a file from the filesystem.
    ///
    /// Deleting a non-existing file may report [`crate::Error::NotFound`],
    /// but that is not a requirement of the interface.
    fn remove_file(&self, path: &Path) -> impl Future<Output = Result<()>> + Send;
}

impl<V: Vfs> Vfs for &V {
    type RandomFile = V::RandomFile;
    type BlockFile = V::BlockFile;

    fn open_for_random_access(
        &self,
        path: &Path,
        create_if_missing: bool,
        error_if_exists: bool,
    ) -> impl Future<Output = Result<(Self::RandomFile, u64)>> + Send {
        (**self).open_for_random_access(path, create_if_missing, error_if_exists)
    }

    fn open_for_block_access(
        &self,
        path: &Path,
        block_shift: usize,
        create_if_missing: bool,
        error_if_exists: bool,
    ) -> impl Future<Output = Result<(Self::BlockFile, u64)>> + Send {
        (**self).open_for_block_access(path, block_shift, create_if_missing, error_if_exists)
    }

    fn remove_file(&self, path: &Path) -> impl Future<Output = Result<()>> + Send {
        (**self).remove_file(path)
    }
}

/// File I/O interface without any assumptions on the access pattern.
///
/// Used for transaction log files. Implementations are encouraged to
/// buffer; any buffering must obey [`RandomAccessFile::flush`] and
/// [`RandomAccessFile::sync`].
pub trait RandomAccessFile: Send {
    /// Reads `buf.len()` bytes starting at `offset`.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> impl Future<Output = Result<()>> + Send;

    /// Writes `data` starting at `offset`, extending the file if needed.
    fn write(&mut self, data: &[u8], offset: u64) -> impl Future<Output = Result<()>> + Send;

    /// Evicts application-level buffers to the operating system.
    ///
    /// After a successful flush the data survives an application crash, but
    /// not necessarily a system crash or power failure. See
    /// [`RandomAccessFile::sync`] for the stronger guarantee.
    fn flush(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Evicts any cached data for the file into persistent storage.
    fn sync(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Closes the file and releases its underlying resources.
    fn close(self) -> impl Future<Output = Result<()>> + Send;

    /// Alias for [`RandomAccessFile::close`], so file handles behave like
    /// the other API objects that end their life in a `release` call.
    fn release(self) -> impl Future<Output = Result<()>> + Send
    where
        Self: Sized,
    {
        self.close()
    }
}

/// Interface for accessing files via block-based I/O.
///
/// Used for store data files; the block size is the store page size. Both
/// the offset and the length of every transfer must be multiples of the
/// block size the file was opened with.
pub trait BlockAccessFile: Send {
    /// Reads a sequence of blocks starting at `offset`.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> impl Future<Output = Result<()>> + Send;

    /// Writes a sequence of blocks starting at `offset`.
    fn write(&mut self, data: &[u8], offset: u64) -> impl Future<Output = Result<()>> + Send;

    /// Evicts any cached data for the file into persistent storage.
    fn sync(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Attempts to acquire an exclusive advisory lock on the file.
    ///
    /// The file stays locked until it is closed. Returns
    /// [`crate::Error::AlreadyLocked`] when another user holds the lock.
    fn lock(&mut self) -> Result<()>;

    /// Closes the file, releasing the lock and its underlying resources.
    fn close(self) -> impl Future<Output = Result<()>> + Send;

    /// Alias for [`BlockAccessFile::close`].
    fn release(self) -> impl Future<Output = Result<()>> + Send
    where
        Self: Sized,
    {
        self.close()
    }
}

/// Returns the process-wide default VFS.
///
/// Initialised on first call and lives until process exit.
pub fn default_vfs() -> &'static FileVfs {
    static DEFAULT: OnceLock<FileVfs> = OnceLock::new();
    DEFAULT.get_or_init(FileVfs::new)
}
