//! Database module for the ACL engine
//!
//! This module provides a libSQL database layer with:
//! - A single persistent connection shared by all callers
//! - Automatic schema migrations
//! - Health check capabilities
//!
//! The membership graph and the resource-action assignment table live here.
//! Everything in the cache layer is a projection of these tables and can be
//! rebuilt from them at any time.

mod migrations;

use libsql::{Connection, Database as LibSqlDatabase};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};

pub use migrations::{Migration, MigrationRunner};

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Database query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Internal database error: {0}")]
    Internal(#[from] libsql::Error),
}

/// Wrapper around a libsql database and its persistent connection
///
/// In-memory libSQL databases are private to a connection, so the wrapper
/// keeps one connection alive for the lifetime of the database and hands out
/// guarded access to it.
#[derive(Clone)]
pub struct Database {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Arc<Mutex<Connection>>,
    name: String,
}

impl Database {
    /// Create a new in-memory database
    #[instrument(skip_all)]
    pub async fn in_memory(name: &str) -> Result<Self, DatabaseError> {
        debug!("Creating in-memory database: {}", name);
        let db = libsql::Builder::new_local(":memory:").build().await?;
        Self::from_libsql(name, db)
    }

    /// Create or open a local file-based database
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open_local(name: &str, path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        debug!("Opening local database '{}' at: {:?}", name, path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                ))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await?;

        info!("Opened database '{}' at {:?}", name, path);
        Self::from_libsql(name, db)
    }

    fn from_libsql(name: &str, db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db.connect()?;
        Ok(Self {
            db: Arc::new(db),
            conn: Arc::new(Mutex::new(conn)),
            name: name.to_string(),
        })
    }

    /// Lock the persistent connection
    pub async fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Get the database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the database is healthy by executing a simple query
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn health_check(&self) -> Result<bool, DatabaseError> {
        let conn = self.connection().await;
        match conn.query("SELECT 1", ()).await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::in_memory("test").await.unwrap();
        assert_eq!(db.name(), "test");
    }

    #[tokio::test]
    async fn test_health_check() {
        let db = Database::in_memory("test").await.unwrap();
        assert!(db.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_connection_is_shared() {
        let db = Database::in_memory("test").await.unwrap();

        {
            let conn = db.connection().await;
            conn.execute("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT)", ())
                .await
                .unwrap();
            conn.execute("INSERT INTO test (name) VALUES ('hello')", ())
                .await
                .unwrap();
        }

        // A later lock sees the same in-memory data
        let conn = db.connection().await;
        let mut rows = conn.query("SELECT name FROM test", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let name: String = row.get(0).unwrap();
        assert_eq!(name, "hello");
    }
}
