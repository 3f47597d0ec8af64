//! Database connection management with pragma configuration.
//!
//! This module handles opening the SQLite database, applying required pragmas
//! for performance and concurrency (WAL mode), and running migrations.

use super::migrations;
use crate::Error;
use std::path::Path;
use tokio_rusqlite::Connection;

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA temp_store=MEMORY;
     PRAGMA foreign_keys=ON;";

/// Cache store handle.
///
/// Wraps a tokio-rusqlite Connection that runs database operations
/// on a background thread. Cloning is cheap and every clone talks to the
/// same connection, so writes are applied in the order they complete.
#[derive(Clone, Debug)]
pub struct CacheDb {
    pub(crate) conn: Connection,
    pub(crate) quota_bytes: Option<u64>,
}

impl CacheDb {
    /// Open a database at the specified path.
    ///
    /// Creates the file if it doesn't exist, applies performance pragmas,
    /// and runs any pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open(path)
            .await
            .map_err(|e| Error::StoreOpen(e.to_string()))?;
        Self::configure(conn).await
    }

    /// Open an in-memory database for testing.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| Error::StoreOpen(e.to_string()))?;
        Self::configure(conn).await
    }

    /// Limit the total payload bytes the store accepts.
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    pub fn quota(&self) -> Option<u64> {
        self.quota_bytes
    }

    /// Close the underlying connection. Every clone fails afterwards.
    pub async fn close(self) -> Result<(), Error> {
        self.conn.close().await.map_err(Error::from)
    }

    async fn configure(conn: Connection) -> Result<Self, Error> {
        conn.call(|conn| {
            conn.execute_batch(PRAGMAS)?;
            Ok(())
        })
        .await
        .map_err(Error::Database)?;

        migrations::run(&conn).await?;

        Ok(Self { conn, quota_bytes: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let version = db
            .conn
            .call(|conn| conn.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0)))
            .await
            .unwrap();
        assert!(!version.is_empty());
    }

    #[tokio::test]
    async fn test_open_file_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offgrid.sqlite");
        let _db = CacheDb::open(&path).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_open_unwritable_path_is_store_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("nested").join("offgrid.sqlite");
        let result = CacheDb::open(&path).await;
        assert!(matches!(result, Err(Error::StoreOpen(_))));
    }

    #[tokio::test]
    async fn test_quota_builder() {
        let db = CacheDb::open_in_memory().await.unwrap();
        assert_eq!(db.quota(), None);
        let db = db.with_quota(1024);
        assert_eq!(db.quota(), Some(1024));
    }

    #[tokio::test]
    async fn test_close_fails_every_clone() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let other = db.clone();
        db.close().await.unwrap();

        let result = other.storage_usage().await;
        assert!(matches!(result, Err(Error::Database(_))));
    }
}
