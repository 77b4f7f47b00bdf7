//! Execution record persistence.

use rusqlite::Connection;
use uuid::Uuid;

use super::StoreResult;

/// The point-in-time record of one invocation. Inserted on completion,
/// never updated, removed only via the parent environment's cascade.
#[derive(Debug, Clone)]
pub struct Execution {
    pub id: Uuid,
    pub environment_id: Uuid,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
}

pub struct ExecutionStore;

impl ExecutionStore {
    pub fn insert(conn: &Connection, exec: &Execution) -> StoreResult<()> {
        conn.execute(
            r#"
            INSERT INTO executions
                (id, environment_id, started_at, completed_at, exit_code, stdout, stderr, duration_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            rusqlite::params![
                exec.id.to_string(),
                exec.environment_id.to_string(),
                exec.started_at,
                exec.completed_at,
                exec.exit_code,
                exec.stdout,
                exec.stderr,
                exec.duration_ms,
            ],
        )?;
        Ok(())
    }

    pub fn list_for_environment(
        conn: &Connection,
        environment_id: &Uuid,
    ) -> StoreResult<Vec<Execution>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, environment_id, started_at, completed_at, exit_code, stdout, stderr, duration_ms
            FROM executions WHERE environment_id = ?1 ORDER BY started_at DESC
            "#,
        )?;

        let rows = stmt
            .query_map([environment_id.to_string()], row_to_execution)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn row_to_execution(row: &rusqlite::Row) -> rusqlite::Result<Execution> {
    let id: String = row.get(0)?;
    let environment_id: String = row.get(1)?;

    Ok(Execution {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        environment_id: Uuid::parse_str(&environment_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        started_at: row.get(2)?,
        completed_at: row.get(3)?,
        exit_code: row.get(4)?,
        stdout: row.get(5)?,
        stderr: row.get(6)?,
        duration_ms: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::environment::{Environment, EnvironmentStatus, EnvironmentStore, RuntimeKind};

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
            CREATE TABLE executions (
                id TEXT PRIMARY KEY,
                environment_id TEXT NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
                started_at INTEGER NOT NULL,
                completed_at INTEGER,
                exit_code INTEGER NOT NULL,
                stdout TEXT NOT NULL,
                stderr TEXT NOT NULL,
                duration_ms INTEGER NOT NULL
            );
            "#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_insert_and_list() {
        let conn = setup_db();
        let env = Environment {
            id: Uuid::new_v4(),
            volume_name: "tee-env-xyz".to_string(),
            main_module: "main.ts".to_string(),
            runtime: RuntimeKind::Deno,
            created_at: 0,
            last_executed_at: None,
            execution_count: 0,
            status: EnvironmentStatus::Ready,
            metadata: "{}".to_string(),
            ttl_seconds: 3600,
        };
        EnvironmentStore::insert(&conn, &env).unwrap();

        let exec = Execution {
            id: Uuid::new_v4(),
            environment_id: env.id,
            started_at: 10,
            completed_at: Some(15),
            exit_code: 0,
            stdout: "{\"sum\":8}".to_string(),
            stderr: String::new(),
            duration_ms: 5,
        };
        ExecutionStore::insert(&conn, &exec).unwrap();

        let list = ExecutionStore::list_for_environment(&conn, &env.id).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].exit_code, 0);
    }
}
