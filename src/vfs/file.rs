//! Filesystem-backed VFS implementation.

use std::io;
use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{BlockAccessFile, RandomAccessFile, Vfs};
use crate::error::{Error, Result};

/// The default, tokio-fs backed VFS.
///
/// Data files are accessed with seek + exact-length transfers; writes past
/// the current end of file extend it. The advisory lock on block files uses
/// the OS file lock, so it also excludes other processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileVfs;

impl FileVfs {
    /// Creates a new filesystem VFS.
    pub fn new() -> Self {
        Self
    }

    async fn open(
        path: &Path,
        create_if_missing: bool,
        error_if_exists: bool,
    ) -> Result<(File, u64)> {
        if error_if_exists && !create_if_missing {
            return Err(Error::InvalidArgument(
                "error_if_exists requires create_if_missing".into(),
            ));
        }

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if error_if_exists {
            options.create_new(true);
        } else if create_if_missing {
            options.create(true);
        }

        let file = options.open(path).await.map_err(map_open_error)?;
        let size = file.metadata().await?.len();
        Ok((file, size))
    }
}

fn map_open_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound,
        io::ErrorKind::AlreadyExists => Error::AlreadyExists,
        _ => Error::Io(e),
    }
}

impl Vfs for FileVfs {
    type RandomFile = FileRandomAccessFile;
    type BlockFile = FileBlockAccessFile;

    async fn open_for_random_access(
        &self,
        path: &Path,
        create_if_missing: bool,
        error_if_exists: bool,
    ) -> Result<(FileRandomAccessFile, u64)> {
        let (file, size) = Self::open(path, create_if_missing, error_if_exists).await?;
        Ok((FileRandomAccessFile { file }, size))
    }

    async fn open_for_block_access(
        &self,
        path: &Path,
        block_shift: usize,
        create_if_missing: bool,
        error_if_exists: bool,
    ) -> Result<(FileBlockAccessFile, u64)> {
        let (file, size) = Self::open(path, create_if_missing, error_if_exists).await?;
        // The OS lock API lives on std::fs::File; keep a dup'd handle around
        // for it. Locks follow the open file description, so both handles
        // cover the same lock.
        let lock_handle = file.try_clone().await?.into_std().await;
        Ok((
            FileBlockAccessFile {
                file,
                lock_handle,
                block_size: 1u64 << block_shift,
            },
            size,
        ))
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_file(path).await.map_err(map_open_error)
    }
}

/// Random-access file handle backed by `tokio::fs::File`.
pub struct FileRandomAccessFile {
    file: File,
}

impl RandomAccessFile for FileRandomAccessFile {
    async fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(io::SeekFrom::Start(offset)).await?;
        self.file.read_exact(buf).await?;
        Ok(())
    }

    async fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        self.file.seek(io::SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        self.file.sync_all().await?;
        Ok(())
    }

    async fn close(mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }
}

/// Block-access file handle backed by `tokio::fs::File`.
pub struct FileBlockAccessFile {
    file: File,
    lock_handle: std::fs::File,
    block_size: u64,
}

impl BlockAccessFile for FileBlockAccessFile {
    async fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(offset % self.block_size, 0);
        debug_assert_eq!(buf.len() as u64 % self.block_size, 0);

        self.file.seek(io::SeekFrom::Start(offset)).await?;
        self.file.read_exact(buf).await?;
        Ok(())
    }

    async fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        debug_assert_eq!(offset % self.block_size, 0);
        debug_assert_eq!(data.len() as u64 % self.block_size, 0);

        self.file.seek(io::SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        self.file.sync_all().await?;
        Ok(())
    }

    fn lock(&mut self) -> Result<()> {
        match self.lock_handle.try_lock() {
            Ok(()) => Ok(()),
            Err(std::fs::TryLockError::WouldBlock) => Err(Error::AlreadyLocked),
            Err(std::fs::TryLockError::Error(e)) => Err(Error::Io(e)),
        }
    }

    async fn close(mut self) -> Result<()> {
        // Dropping the handles releases the advisory lock.
        self.file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.berry");
        let vfs = FileVfs::new();

        let (file, size) = vfs
            .open_for_block_access(&path, 12, true, false)
            .await
            .unwrap();
        assert_eq!(size, 0);
        file.close().await.unwrap();
        assert!(path.exists());

        // Reopening without create flags succeeds now that the file exists.
        let (file, size) = vfs
            .open_for_block_access(&path, 12, false, false)
            .await
            .unwrap();
        assert_eq!(size, 0);
        file.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_if_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.berry");
        let vfs = FileVfs::new();

        let (file, _) = vfs
            .open_for_block_access(&path, 12, true, true)
            .await
            .unwrap();
        file.close().await.unwrap();

        let result = vfs.open_for_block_access(&path, 12, true, true).await;
        assert!(matches!(result, Err(Error::AlreadyExists)));
    }

    #[tokio::test]
    async fn test_error_if_exists_requires_create() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.berry");
        let vfs = FileVfs::new();

        let result = vfs.open_for_block_access(&path, 12, false, true).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_open_missing_without_create() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.berry");
        let vfs = FileVfs::new();

        let result = vfs.open_for_block_access(&path, 12, false, false).await;
        assert!(matches!(result, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_block_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.berry");
        let vfs = FileVfs::new();

        let block = vec![0xA5u8; 4096];
        {
            let (mut file, _) = vfs
                .open_for_block_access(&path, 12, true, false)
                .await
                .unwrap();
            file.write(&block, 4096).await.unwrap();
            file.sync().await.unwrap();
            file.close().await.unwrap();
        }

        let (mut file, size) = vfs
            .open_for_block_access(&path, 12, false, false)
            .await
            .unwrap();
        assert_eq!(size, 8192);
        let mut buf = vec![0u8; 4096];
        file.read(4096, &mut buf).await.unwrap();
        assert_eq!(buf, block);
    }

    #[tokio::test]
    async fn test_read_past_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.berry");
        let vfs = FileVfs::new();

        let (mut file, _) = vfs
            .open_for_block_access(&path, 12, true, false)
            .await
            .unwrap();
        let mut buf = vec![0u8; 4096];
        let result = file.read(0, &mut buf).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_lock_excludes_second_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.berry");
        let vfs = FileVfs::new();

        let (mut first, _) = vfs
            .open_for_block_access(&path, 12, true, false)
            .await
            .unwrap();
        first.lock().unwrap();

        let (mut second, _) = vfs
            .open_for_block_access(&path, 12, false, false)
            .await
            .unwrap();
        assert!(matches!(second.lock(), Err(Error::AlreadyLocked)));

        // Closing the holder releases the lock.
        second.close().await.unwrap();
        first.close().await.unwrap();
        let (mut third, _) = vfs
            .open_for_block_access(&path, 12, false, false)
            .await
            .unwrap();
        third.lock().unwrap();
    }

    #[tokio::test]
    async fn test_remove_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.berry");
        let vfs = FileVfs::new();

        let (file, _) = vfs
            .open_for_random_access(&path, true, false)
            .await
            .unwrap();
        file.close().await.unwrap();

        vfs.remove_file(&path).await.unwrap();
        assert!(!path.exists());
        assert!(matches!(
            vfs.remove_file(&path).await,
            Err(Error::NotFound)
        ));
    }
}
