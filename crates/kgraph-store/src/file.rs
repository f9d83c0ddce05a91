//! Embedded, file-backed backend: one SQLite connection, one writer.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use kgraph_core::{BackendKind, KgError, Result};

use crate::sql::{configure_connection, create_shared_schema, map_sql_error, SqlBackend, SqlExecutor};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A single connection serialized behind a mutex.
#[derive(Clone)]
pub struct SingleConnection {
    conn: Arc<Mutex<Connection>>,
}

#[async_trait]
impl SqlExecutor for SingleConnection {
    const KIND: BackendKind = BackendKind::File;

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| KgError::TransientBackend(format!("sqlite worker failed: {e}")))?
    }
}

/// SQLite file with ACID transactions per call.
pub type FileBackend = SqlBackend<SingleConnection>;

impl SqlBackend<SingleConnection> {
    /// Open or create the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Io`] if the parent directory cannot be created and
    /// [`KgError::Backend`] if SQLite cannot open the file or create the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(map_sql_error)?;
        configure_connection(&conn, BUSY_TIMEOUT)?;
        create_shared_schema(&conn, None)?;
        info!(path = %path.display(), "opened file backend");
        Ok(Self::from_executor(
            SingleConnection {
                conn: Arc::new(Mutex::new(conn)),
            },
            None,
        ))
    }

    /// Private in-memory database (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Backend`] if schema creation fails.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(map_sql_error)?;
        configure_connection(&conn, BUSY_TIMEOUT)?;
        create_shared_schema(&conn, None)?;
        Ok(Self::from_executor(
            SingleConnection {
                conn: Arc::new(Mutex::new(conn)),
            },
            None,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Scope, StorageBackend};
    use kgraph_core::{Entity, WriteMode};

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("graph.db");
        let scope = Scope::shared("acme");
        {
            let backend = FileBackend::open(&path).unwrap();
            backend
                .add_entity(&scope, Entity::new("alice", "Person"), WriteMode::Insert)
                .await
                .unwrap();
        }
        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.kind(), BackendKind::File);
        let alice = backend.get_entity(&scope, "alice").await.unwrap();
        assert_eq!(alice.entity_type, "Person");
    }

    #[tokio::test]
    async fn failed_batch_rolls_back() {
        let backend = FileBackend::in_memory().unwrap();
        let scope = Scope::shared("acme");
        let batch = vec![Entity::new("a", "T"), Entity::new("a", "T")];
        assert!(backend.batch_add_entities(&scope, batch, WriteMode::Insert).await.is_err());
        assert!(backend.get_entity(&scope, "a").await.is_err());
    }
}
