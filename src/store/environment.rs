//! Environment record persistence.

use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use super::{StoreError, StoreResult};

/// Which script runtime image and cache layout an environment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Deno,
    Node,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Deno => "deno",
            RuntimeKind::Node => "node",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deno" => Some(RuntimeKind::Deno),
            "node" => Some(RuntimeKind::Node),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentStatus {
    Ready,
    Failed,
}

impl EnvironmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentStatus::Ready => "ready",
            EnvironmentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(EnvironmentStatus::Ready),
            "failed" => Some(EnvironmentStatus::Failed),
            _ => None,
        }
    }
}

/// The durable record of a prepared sandbox.
#[derive(Debug, Clone)]
pub struct Environment {
    pub id: Uuid,
    pub volume_name: String,
    pub main_module: String,
    pub runtime: RuntimeKind,
    pub created_at: i64,
    pub last_executed_at: Option<i64>,
    pub execution_count: u64,
    pub status: EnvironmentStatus,
    /// JSON blob: recorded permissions, module count, dependency count.
    pub metadata: String,
    pub ttl_seconds: i64,
}

pub struct EnvironmentStore;

impl EnvironmentStore {
    pub fn insert(conn: &Connection, env: &Environment) -> StoreResult<()> {
        conn.execute(
            r#"
            INSERT INTO environments
                (id, volume_name, main_module, runtime, created_at, last_executed_at,
                 execution_count, status, metadata, ttl_seconds)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            rusqlite::params![
                env.id.to_string(),
                env.volume_name,
                env.main_module,
                env.runtime.as_str(),
                env.created_at,
                env.last_executed_at,
                env.execution_count as i64,
                env.status.as_str(),
                env.metadata,
                env.ttl_seconds,
            ],
        )?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: &Uuid) -> StoreResult<Option<Environment>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, volume_name, main_module, runtime, created_at, last_executed_at,
                   execution_count, status, metadata, ttl_seconds
            FROM environments WHERE id = ?1
            "#,
        )?;

        stmt.query_row([id.to_string()], row_to_environment)
            .optional()
            .map_err(StoreError::from)
    }

    pub fn delete(conn: &Connection, id: &Uuid) -> StoreResult<()> {
        conn.execute("DELETE FROM environments WHERE id = ?1", [id.to_string()])?;
        Ok(())
    }

    pub fn list(conn: &Connection) -> StoreResult<Vec<Environment>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, volume_name, main_module, runtime, created_at, last_executed_at,
                   execution_count, status, metadata, ttl_seconds
            FROM environments ORDER BY created_at DESC
            "#,
        )?;

        let rows = stmt
            .query_map([], row_to_environment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_expired(conn: &Connection, now: i64) -> StoreResult<Vec<Environment>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, volume_name, main_module, runtime, created_at, last_executed_at,
                   execution_count, status, metadata, ttl_seconds
            FROM environments WHERE created_at + ttl_seconds < ?1
            "#,
        )?;

        let rows = stmt
            .query_map([now], row_to_environment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn record_execution(conn: &Connection, id: &Uuid, now: i64) -> StoreResult<()> {
        conn.execute(
            r#"
            UPDATE environments
            SET execution_count = execution_count + 1, last_executed_at = ?2
            WHERE id = ?1
            "#,
            rusqlite::params![id.to_string(), now],
        )?;
        Ok(())
    }
}

fn row_to_environment(row: &rusqlite::Row) -> rusqlite::Result<Environment> {
    let id: String = row.get(0)?;
    let runtime: String = row.get(3)?;
    let status: String = row.get(7)?;

    Ok(Environment {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        volume_name: row.get(1)?,
        main_module: row.get(2)?,
        runtime: RuntimeKind::parse(&runtime).unwrap_or(RuntimeKind::Deno),
        created_at: row.get(4)?,
        last_executed_at: row.get(5)?,
        execution_count: row.get::<_, i64>(6)? as u64,
        status: EnvironmentStatus::parse(&status).unwrap_or(EnvironmentStatus::Failed),
        metadata: row.get(8)?,
        ttl_seconds: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE environments (
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
            "#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_insert_and_get() {
        let conn = setup_db();
        let env = Environment {
            id: Uuid::new_v4(),
            volume_name: "tee-env-abc".to_string(),
            main_module: "main.ts".to_string(),
            runtime: RuntimeKind::Deno,
            created_at: 100,
            last_executed_at: None,
            execution_count: 0,
            status: EnvironmentStatus::Ready,
            metadata: "{}".to_string(),
            ttl_seconds: 3600,
        };

        EnvironmentStore::insert(&conn, &env).unwrap();
        let loaded = EnvironmentStore::get(&conn, &env.id).unwrap().unwrap();
        assert_eq!(loaded.volume_name, "tee-env-abc");
        assert_eq!(loaded.execution_count, 0);
    }

    #[test]
    fn test_record_execution() {
        let conn = setup_db();
        let env = Environment {
            id: Uuid::new_v4(),
            volume_name: "tee-env-def".to_string(),
            main_module: "main.ts".to_string(),
            runtime: RuntimeKind::Node,
            created_at: 100,
            last_executed_at: None,
            execution_count: 0,
            status: EnvironmentStatus::Ready,
            metadata: "{}".to_string(),
            ttl_seconds: 3600,
        };
        EnvironmentStore::insert(&conn, &env).unwrap();

        EnvironmentStore::record_execution(&conn, &env.id, 200).unwrap();
        EnvironmentStore::record_execution(&conn, &env.id, 300).unwrap();

        let loaded = EnvironmentStore::get(&conn, &env.id).unwrap().unwrap();
        assert_eq!(loaded.execution_count, 2);
        assert_eq!(loaded.last_executed_at, Some(300));
    }

    #[test]
    fn test_list_expired() {
        let conn = setup_db();
        let env = Environment {
            id: Uuid::new_v4(),
            volume_name: "tee-env-ghi".to_string(),
            main_module: "main.ts".to_string(),
            runtime: RuntimeKind::Deno,
            created_at: 100,
            last_executed_at: None,
            execution_count: 0,
            status: EnvironmentStatus::Ready,
            metadata: "{}".to_string(),
            ttl_seconds: 10,
        };
        EnvironmentStore::insert(&conn, &env).unwrap();

        assert!(EnvironmentStore::list_expired(&conn, 105).unwrap().is_empty());
        assert_eq!(EnvironmentStore::list_expired(&conn, 200).unwrap().len(), 1);
    }
}
