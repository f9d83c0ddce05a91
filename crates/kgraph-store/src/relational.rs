//! Relational backend: a bounded pool of SQLite connections with an optional
//! sqlite-vec nearest-neighbour index.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use kgraph_core::config::StorageConfig;
use kgraph_core::{BackendKind, KgError, Result};

use crate::sql::{configure_connection, create_shared_schema, map_sql_error, SqlBackend, SqlExecutor};

struct PoolState {
    idle: Vec<Connection>,
    /// Connections opened so far, idle or checked out.
    open: usize,
}

/// Pool of up to `max` connections. Callers wait at most `acquire_timeout`
/// for a free slot.
pub struct ConnectionPool {
    path: PathBuf,
    max: usize,
    acquire_timeout: Duration,
    busy_timeout: Duration,
    slots: Arc<Semaphore>,
    state: Arc<Mutex<PoolState>>,
}

impl ConnectionPool {
    fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection> {
        let conn = Connection::open(path).map_err(map_sql_error)?;
        configure_connection(&conn, busy_timeout)?;
        Ok(conn)
    }

    fn new(path: &Path, config: &StorageConfig) -> Result<Self> {
        let busy_timeout = config.acquire_timeout();
        let mut idle = Vec::with_capacity(config.pool_max);
        for _ in 0..config.pool_min {
            idle.push(Self::open_connection(path, busy_timeout)?);
        }
        Ok(Self {
            path: path.to_path_buf(),
            max: config.pool_max,
            acquire_timeout: config.acquire_timeout(),
            busy_timeout,
            slots: Arc::new(Semaphore::new(config.pool_max)),
            state: Arc::new(Mutex::new(PoolState {
                open: idle.len(),
                idle,
            })),
        })
    }

    /// Connections currently opened by the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.state.lock().open
    }

    /// Permits currently available.
    #[must_use]
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    fn exhausted(&self) -> KgError {
        KgError::ResourceExhausted {
            resource: "connection pool".to_string(),
            capacity: Some(self.max),
        }
    }
}

#[async_trait]
impl SqlExecutor for ConnectionPool {
    const KIND: BackendKind = BackendKind::Relational;

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let permit = tokio::time::timeout(self.acquire_timeout, Arc::clone(&self.slots).acquire_owned())
            .await
            .map_err(|_| self.exhausted())?
            .map_err(|_| self.exhausted())?;

        let state = Arc::clone(&self.state);
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let pooled = state.lock().idle.pop();
            let mut conn = match pooled {
                Some(conn) => conn,
                None => {
                    let conn = ConnectionPool::open_connection(&path, busy_timeout)?;
                    state.lock().open += 1;
                    debug!("opened pooled connection");
                    conn
                }
            };
            let out = f(&mut conn);
            state.lock().idle.push(conn);
            out
        })
        .await
        .map_err(|e| KgError::TransientBackend(format!("sqlite worker failed: {e}")))?
    }
}

/// Pooled SQLite backend.
pub type RelationalBackend = SqlBackend<ConnectionPool>;

impl SqlBackend<ConnectionPool> {
    /// Open the database at `path` with the pool bounds from `config`.
    ///
    /// `vector_dimension` sizes the sqlite-vec table when
    /// `config.native_vector_index` is set.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Backend`] if the database or schema cannot be created.
    pub fn open(path: &Path, config: &StorageConfig, vector_dimension: usize) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let native = config.native_vector_index.then_some(vector_dimension);
        if native.is_some() {
            crate::vec_extension::register();
        }

        let setup = ConnectionPool::open_connection(path, config.acquire_timeout())?;
        create_shared_schema(&setup, native)?;
        drop(setup);

        let pool = ConnectionPool::new(path, config)?;
        info!(
            path = %path.display(),
            pool_min = config.pool_min,
            pool_max = config.pool_max,
            native_vector_index = native.is_some(),
            "opened relational backend"
        );
        Ok(Self::from_executor(pool, native))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Scope, StorageBackend};
    use kgraph_core::{Entity, ErrorKind, WriteMode};

    fn config(pool_max: usize) -> StorageConfig {
        StorageConfig {
            pool_min: 1,
            pool_max,
            acquire_timeout_ms: 50,
            ..StorageConfig::default()
        }
    }

    #[tokio::test]
    async fn pool_grows_to_max_and_reuses_connections() {
        let dir = tempfile::tempdir().unwrap();
        let backend = RelationalBackend::open(&dir.path().join("g.db"), &config(2), 4).unwrap();
        let scope = Scope::shared("acme");
        for i in 0..5 {
            backend
                .add_entity(&scope, Entity::new(format!("e{i}"), "T"), WriteMode::Insert)
                .await
                .unwrap();
        }
        assert_eq!(backend.stats(&scope).await.unwrap().entity_count, 5);
    }

    #[tokio::test]
    async fn pool_exhaustion_reports_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.db");
        let pool = Arc::new(ConnectionPool::new(&path, &config(1)).unwrap());

        let (held_tx, held_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.with_conn(move |_conn| {
                    let _ = held_tx.send(());
                    let _ = release_rx.recv();
                    Ok(())
                })
                .await
            })
        };
        held_rx.await.unwrap();

        let err = pool.with_conn(|_conn| Ok(())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(err.to_string().contains("capacity 1"));

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn native_vector_index_matches_brute_force() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(2);
        cfg.native_vector_index = true;
        let backend = RelationalBackend::open(&dir.path().join("g.db"), &cfg, 3).unwrap();
        assert!(backend.native_vector_index());

        let scope = Scope::shared("acme");
        let other = Scope::shared("globex");
        for (id, v) in [("a", [1.0, 0.0, 0.0]), ("b", [0.7, 0.7, 0.0]), ("c", [0.0, 0.0, 1.0])] {
            backend
                .add_entity(&scope, Entity::new(id, "Doc").with_embedding(v.to_vec()), WriteMode::Insert)
                .await
                .unwrap();
        }
        backend
            .add_entity(&other, Entity::new("z", "Doc").with_embedding(vec![1.0, 0.0, 0.0]), WriteMode::Insert)
            .await
            .unwrap();

        let hits = backend.vector_search(&scope, &[1.0, 0.1, 0.0], 2, None).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|(e, _)| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(hits[0].1 > hits[1].1);
    }
}
