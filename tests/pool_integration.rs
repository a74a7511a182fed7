//! Pool, store, and transaction lifecycle against the filesystem VFS.

use berrydb::error::Error;
use berrydb::page_pool::PageFetchMode;
use berrydb::pool::{Pool, PoolOptions};
use berrydb::store::{StoreOptions, log_file_path};
use berrydb::vfs::default_vfs;
use tempfile::tempdir;

const MUST_CREATE: StoreOptions = StoreOptions {
    create_if_missing: true,
    error_if_exists: true,
};
const CREATE: StoreOptions = StoreOptions {
    create_if_missing: true,
    error_if_exists: false,
};

fn small_pool() -> Pool<berrydb::vfs::FileVfs> {
    Pool::create(PoolOptions {
        page_shift: 12,
        page_pool_size: 42,
    })
    .unwrap()
}

#[tokio::test]
async fn test_pool_create_open_close_store() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.berry");

    let pool = small_pool();
    assert_eq!(pool.page_size(), 4096);
    assert_eq!(pool.page_pool_size(), 42);

    let store = pool.open_store(&path, MUST_CREATE).await.unwrap();
    assert!(!store.is_closed());
    assert_eq!(store.path(), path);
    store.close().await.unwrap();
    assert!(store.is_closed());

    // Must-create-new fails once the file exists.
    let result = pool.open_store(&path, MUST_CREATE).await;
    assert!(matches!(result, Err(Error::AlreadyExists)));

    // A plain open succeeds.
    let store = pool.open_store(&path, CREATE).await.unwrap();
    assert!(!store.is_closed());
    store.close().await.unwrap();

    pool.release().await.unwrap();
}

#[tokio::test]
async fn test_error_if_exists_requires_create_if_missing() {
    let dir = tempdir().unwrap();
    let pool = small_pool();

    let result = pool
        .open_store(
            dir.path().join("test.berry"),
            StoreOptions {
                create_if_missing: false,
                error_if_exists: true,
            },
        )
        .await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[tokio::test]
async fn test_open_missing_store_without_create() {
    let dir = tempdir().unwrap();
    let pool = small_pool();

    let result = pool
        .open_store(dir.path().join("missing.berry"), StoreOptions::default())
        .await;
    assert!(matches!(result, Err(Error::NotFound)));
}

#[tokio::test]
async fn test_open_store_creates_log_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.berry");

    let pool = small_pool();
    let store = pool.open_store(&path, MUST_CREATE).await.unwrap();

    assert!(log_file_path(&path).exists());
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_second_open_is_locked_out() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.berry");

    let pool = small_pool();
    let store = pool.open_store(&path, CREATE).await.unwrap();

    let result = pool.open_store(&path, CREATE).await;
    assert!(matches!(result, Err(Error::AlreadyLocked)));

    // Closing the holder releases the lock.
    store.close().await.unwrap();
    let store = pool.open_store(&path, CREATE).await.unwrap();
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_close_aborts_open_transaction() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.berry");

    let pool = small_pool();
    let store = pool.open_store(&path, MUST_CREATE).await.unwrap();
    let txn = store.begin_transaction().unwrap();
    assert!(!txn.is_committed());
    assert!(!txn.is_rolled_back());
    assert!(!txn.is_closed());

    store.close().await.unwrap();

    assert!(!txn.is_committed());
    assert!(txn.is_rolled_back());
    assert!(txn.is_closed());
}

#[tokio::test]
async fn test_release_closes_everything() {
    let dir = tempdir().unwrap();
    let pool = small_pool();

    let store_a = pool
        .open_store(dir.path().join("a.berry"), CREATE)
        .await
        .unwrap();
    let store_b = pool
        .open_store(dir.path().join("b.berry"), CREATE)
        .await
        .unwrap();
    let txn_a = store_a.begin_transaction().unwrap();
    let txn_b = store_b.begin_transaction().unwrap();

    pool.release().await.unwrap();

    assert!(store_a.is_closed());
    assert!(store_b.is_closed());
    assert!(txn_a.is_rolled_back() && txn_a.is_closed());
    assert!(txn_b.is_rolled_back() && txn_b.is_closed());
}

#[tokio::test]
async fn test_data_persists_across_pools() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.berry");

    {
        let pool = small_pool();
        let store = pool.open_store(&path, MUST_CREATE).await.unwrap();
        let txn = store.begin_transaction().unwrap();
        for page_id in 0..4u64 {
            let page = store
                .page(page_id, PageFetchMode::IgnoreData)
                .await
                .unwrap();
            txn.claim_page(&page).unwrap();
            page.with_data_mut(|data| data.fill(0x10 + page_id as u8));
        }
        txn.commit().await.unwrap();
        pool.release().await.unwrap();
    }

    let pool = small_pool();
    let store = pool.open_store(&path, CREATE).await.unwrap();
    for page_id in 0..4u64 {
        let page = store
            .page(page_id, PageFetchMode::FetchData)
            .await
            .unwrap();
        page.with_data(|data| {
            assert!(data.iter().all(|&b| b == 0x10 + page_id as u8));
        });
    }
    pool.release().await.unwrap();
}

#[tokio::test]
async fn test_pool_on_shared_default_vfs() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.berry");

    let pool = Pool::with_vfs(
        PoolOptions {
            page_shift: 12,
            page_pool_size: 8,
        },
        default_vfs(),
    )
    .unwrap();

    let store = pool.open_store(&path, MUST_CREATE).await.unwrap();
    store.close().await.unwrap();
    pool.release().await.unwrap();
}

#[tokio::test]
async fn test_truncated_data_file_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.berry");
    std::fs::write(&path, vec![0u8; 100]).unwrap();

    let pool = small_pool();
    let result = pool.open_store(&path, CREATE).await;
    assert!(matches!(result, Err(Error::Corrupted(_))));
}

#[tokio::test]
async fn test_pool_options_validation() {
    assert!(matches!(
        Pool::create(PoolOptions {
            page_shift: 2,
            page_pool_size: 8,
        }),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        Pool::create(PoolOptions {
            page_shift: 32,
            page_pool_size: 8,
        }),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        Pool::create(PoolOptions {
            page_shift: 12,
            page_pool_size: 0,
        }),
        Err(Error::InvalidArgument(_))
    ));
}
