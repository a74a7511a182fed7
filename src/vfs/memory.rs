//! In-memory VFS implementation.
//!
//! Backs both file flavors with growable byte vectors. Useful for tests and
//! for ephemeral workloads that never want to touch disk.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{BlockAccessFile, RandomAccessFile, Vfs};
use crate::error::{Error, Result};

/// In-memory VFS.
///
/// Cloning the VFS shares the same file namespace, so a store closed through
/// one clone can be reopened through another. Advisory locks are tracked per
/// path and released when the holding handle is dropped.
#[derive(Clone, Default)]
pub struct MemoryVfs {
    inner: Arc<Mutex<MemoryVfsState>>,
}

#[derive(Default)]
struct MemoryVfsState {
    files: HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>,
    locked: HashSet<PathBuf>,
}

impl MemoryVfs {
    /// Creates a new VFS with an empty file namespace.
    pub fn new() -> Self {
        Self::default()
    }

    fn open(
        &self,
        path: &Path,
        create_if_missing: bool,
        error_if_exists: bool,
    ) -> Result<(MemoryFile, u64)> {
        if error_if_exists && !create_if_missing {
            return Err(Error::InvalidArgument(
                "error_if_exists requires create_if_missing".into(),
            ));
        }

        let mut state = self.inner.lock();
        let data = match state.files.get(path) {
            Some(data) => {
                if error_if_exists {
                    return Err(Error::AlreadyExists);
                }
                Arc::clone(data)
            }
            None => {
                if !create_if_missing {
                    return Err(Error::NotFound);
                }
                let data = Arc::new(Mutex::new(Vec::new()));
                state.files.insert(path.to_path_buf(), Arc::clone(&data));
                data
            }
        };

        let size = data.lock().len() as u64;
        Ok((
            MemoryFile {
                vfs: Arc::clone(&self.inner),
                path: path.to_path_buf(),
                data,
                holds_lock: false,
            },
            size,
        ))
    }
}

impl Vfs for MemoryVfs {
    type RandomFile = MemoryFile;
    type BlockFile = MemoryFile;

    async fn open_for_random_access(
        &self,
        path: &Path,
        create_if_missing: bool,
        error_if_exists: bool,
    ) -> Result<(MemoryFile, u64)> {
        self.open(path, create_if_missing, error_if_exists)
    }

    async fn open_for_block_access(
        &self,
        path: &Path,
        _block_shift: usize,
        create_if_missing: bool,
        error_if_exists: bool,
    ) -> Result<(MemoryFile, u64)> {
        self.open(path, create_if_missing, error_if_exists)
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        match self.inner.lock().files.remove(path) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound),
        }
    }
}

/// Handle to a file inside a [`MemoryVfs`].
///
/// Serves as both the random-access and the block-access flavor.
pub struct MemoryFile {
    vfs: Arc<Mutex<MemoryVfsState>>,
    path: PathBuf,
    data: Arc<Mutex<Vec<u8>>>,
    holds_lock: bool,
}

impl MemoryFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of file",
            )));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, bytes: &[u8], offset: u64) -> Result<()> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + bytes.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn try_lock_path(&mut self) -> Result<()> {
        if self.holds_lock {
            return Ok(());
        }
        let mut state = self.vfs.lock();
        if !state.locked.insert(self.path.clone()) {
            return Err(Error::AlreadyLocked);
        }
        self.holds_lock = true;
        Ok(())
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        if self.holds_lock {
            self.vfs.lock().locked.remove(&self.path);
        }
    }
}

impl RandomAccessFile for MemoryFile {
    async fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.read_at(offset, buf)
    }

    async fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        self.write_at(data, offset)
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(self) -> Result<()> {
        Ok(())
    }
}

impl BlockAccessFile for MemoryFile {
    async fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.read_at(offset, buf)
    }

    async fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        self.write_at(data, offset)
    }

    async fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn lock(&mut self) -> Result<()> {
        self.try_lock_path()
    }

    async fn close(self) -> Result<()> {
        Ok(())
    }
}
