//! Metadata Store Adapter
//!
//! SQLite-backed persistence of Environment and Execution records, guarded
//! by a single-connection async mutex in the style of this project's
//! ancestor daemon's `Database` wrapper.

mod environment;
mod execution;

pub use environment::{Environment, EnvironmentStatus, EnvironmentStore, RuntimeKind};
pub use execution::{Execution, ExecutionStore};

use std::path::Path;

use rusqlite::{Connection, Result as SqliteResult};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The metadata store: one SQLite connection behind a mutex, sized like a
/// one-connection pool. Every write goes through this lock; reads do too,
/// since rusqlite connections aren't `Sync`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init_tables(&conn)?;

        info!("store opened at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_tables(conn: &Connection) -> SqliteResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS environments (
                id TEXT PRIMARY KEY,
                volume_name TEXT NOT NULL UNIQUE,
                main_module TEXT NOT NULL,
                runtime TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_executed_at INTEGER,
                execution_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                metadata TEXT NOT NULL,
                ttl_seconds INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_environments_created_at
                ON environments(created_at);
            CREATE INDEX IF NOT EXISTS idx_environments_last_executed_at
                ON environments(last_executed_at);
            CREATE INDEX IF NOT EXISTS idx_environments_status
                ON environments(status);

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                environment_id TEXT NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
                started_at INTEGER NOT NULL,
                completed_at INTEGER,
                exit_code INTEGER NOT NULL,
                stdout TEXT NOT NULL,
                stderr TEXT NOT NULL,
                duration_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_executions_environment_id
                ON executions(environment_id);
            CREATE INDEX IF NOT EXISTS idx_executions_started_at
                ON executions(started_at);
            "#,
        )?;

        // Enforce the cascade declared above; SQLite ignores foreign keys
        // unless this pragma is set per-connection.
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(())
    }

    pub async fn environments(&self) -> EnvironmentStoreWithConn<'_> {
        EnvironmentStoreWithConn {
            conn: self.conn.lock().await,
        }
    }

    pub async fn executions(&self) -> ExecutionStoreWithConn<'_> {
        ExecutionStoreWithConn {
            conn: self.conn.lock().await,
        }
    }
}

pub struct EnvironmentStoreWithConn<'a> {
    conn: tokio::sync::MutexGuard<'a, Connection>,
}

impl EnvironmentStoreWithConn<'_> {
    pub fn insert(&self, env: &Environment) -> StoreResult<()> {
        EnvironmentStore::insert(&self.conn, env)
    }

    pub fn get(&self, id: &uuid::Uuid) -> StoreResult<Option<Environment>> {
        EnvironmentStore::get(&self.conn, id)
    }

    pub fn delete(&self, id: &uuid::Uuid) -> StoreResult<()> {
        EnvironmentStore::delete(&self.conn, id)
    }

    pub fn list(&self) -> StoreResult<Vec<Environment>> {
        EnvironmentStore::list(&self.conn)
    }

    pub fn list_expired(&self, now: i64) -> StoreResult<Vec<Environment>> {
        EnvironmentStore::list_expired(&self.conn, now)
    }

    pub fn record_execution(&self, id: &uuid::Uuid, now: i64) -> StoreResult<()> {
        EnvironmentStore::record_execution(&self.conn, id, now)
    }
}

pub struct ExecutionStoreWithConn<'a> {
    conn: tokio::sync::MutexGuard<'a, Connection>,
}

impl ExecutionStoreWithConn<'_> {
    pub fn insert(&self, exec: &Execution) -> StoreResult<()> {
        ExecutionStore::insert(&self.conn, exec)
    }

    pub fn list_for_environment(&self, environment_id: &uuid::Uuid) -> StoreResult<Vec<Execution>> {
        ExecutionStore::list_for_environment(&self.conn, environment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::environment::{Environment, EnvironmentStatus, RuntimeKind};

    #[tokio::test]
    async fn test_store_open_and_roundtrip() {
        let store = Store::open_in_memory().unwrap();

        let env = Environment {
            id: uuid::Uuid::new_v4(),
            volume_name: "tee-env-test".to_string(),
            main_module: "main.ts".to_string(),
            runtime: RuntimeKind::Deno,
            created_at: 1_000,
            last_executed_at: None,
            execution_count: 0,
            status: EnvironmentStatus::Ready,
            metadata: "{}".to_string(),
            ttl_seconds: 3600,
        };

        {
            let envs = store.environments().await;
            envs.insert(&env).unwrap();
        }

        {
            let envs = store.environments().await;
            let loaded = envs.get(&env.id).unwrap();
            assert!(loaded.is_some());
            assert_eq!(loaded.unwrap().volume_name, "tee-env-test");
        }
    }
}
