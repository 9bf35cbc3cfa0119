//! SQLite-backed cluster store.
//!
//! Each record kind lives in its own `(key, body)` table with a JSON body.
//! A single-row `cluster_state` table carries the revision, bumped in the
//! same transaction as the mutations it covers.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::{ClusterSnapshot, ClusterStore, Group, Mutation, StoreError, DEFAULT_GROUP};

const MEMBERS: &str = "members";
const GROUPS: &str = "member_groups";
const PROJECTS: &str = "projects";
const POOLS: &str = "pools";
const TOKENS: &str = "tokens";
const RESOURCES: &str = "resources";

/// Durable cluster store on a single SQLite database.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS cluster_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            revision INTEGER NOT NULL DEFAULT 0
        );

        INSERT OR IGNORE INTO cluster_state (id) VALUES (1);

        CREATE TABLE IF NOT EXISTS members (key TEXT PRIMARY KEY, body TEXT NOT NULL);
        CREATE TABLE IF NOT EXISTS member_groups (key TEXT PRIMARY KEY, body TEXT NOT NULL);
        CREATE TABLE IF NOT EXISTS projects (key TEXT PRIMARY KEY, body TEXT NOT NULL);
        CREATE TABLE IF NOT EXISTS pools (key TEXT PRIMARY KEY, body TEXT NOT NULL);
        CREATE TABLE IF NOT EXISTS tokens (key TEXT PRIMARY KEY, body TEXT NOT NULL);
        CREATE TABLE IF NOT EXISTS resources (key TEXT PRIMARY KEY, body TEXT NOT NULL);
        "#,
    )?;

    let default_group = serde_json::to_string(&Group {
        name: DEFAULT_GROUP.to_string(),
        description: "Default cluster group".to_string(),
    })?;
    conn.execute(
        "INSERT OR IGNORE INTO member_groups (key, body) VALUES (?1, ?2)",
        params![DEFAULT_GROUP, default_group],
    )?;

    debug!("Cluster store schema initialized");
    Ok(())
}

fn read_revision(tx: &Transaction<'_>) -> Result<u64, StoreError> {
    let revision: i64 =
        tx.query_row("SELECT revision FROM cluster_state WHERE id = 1", [], |row| {
            row.get(0)
        })?;
    u64::try_from(revision).map_err(|_| StoreError::Corrupt(format!("revision {revision}")))
}

fn load_table<T: DeserializeOwned>(tx: &Transaction<'_>, table: &str) -> Result<Vec<T>, StoreError> {
    let mut stmt = tx.prepare(&format!("SELECT body FROM {table} ORDER BY key"))?;
    let bodies = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    bodies
        .iter()
        .map(|body| serde_json::from_str(body).map_err(StoreError::from))
        .collect()
}

fn put<T: Serialize>(tx: &Transaction<'_>, table: &str, key: &str, record: &T) -> Result<(), StoreError> {
    let body = serde_json::to_string(record)?;
    tx.execute(
        &format!(
            "INSERT INTO {table} (key, body) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET body = excluded.body"
        ),
        params![key, body],
    )?;
    Ok(())
}

fn delete(tx: &Transaction<'_>, table: &str, key: &str) -> Result<(), StoreError> {
    tx.execute(&format!("DELETE FROM {table} WHERE key = ?1"), params![key])?;
    Ok(())
}

fn apply(tx: &Transaction<'_>, mutation: &Mutation) -> Result<(), StoreError> {
    match mutation {
        Mutation::PutMember(m) => put(tx, MEMBERS, &m.id.to_string(), m),
        Mutation::DeleteMember(id) => delete(tx, MEMBERS, &id.to_string()),
        Mutation::PutGroup(g) => put(tx, GROUPS, &g.name, g),
        Mutation::DeleteGroup(name) => delete(tx, GROUPS, name),
        Mutation::PutProject(p) => put(tx, PROJECTS, &p.name, p),
        Mutation::PutPool(p) => put(tx, POOLS, &p.name, p),
        Mutation::PutToken(t) => put(tx, TOKENS, &t.server_name, t),
        Mutation::DeleteToken(server_name) => delete(tx, TOKENS, server_name),
        Mutation::PutResource(r) => put(tx, RESOURCES, &r.id.to_string(), r),
        Mutation::DeleteResource(id) => delete(tx, RESOURCES, &id.to_string()),
    }
}

#[async_trait]
impl ClusterStore for SqliteStore {
    async fn snapshot(&self) -> Result<ClusterSnapshot, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut snapshot = ClusterSnapshot {
                revision: read_revision(&tx)?,
                ..ClusterSnapshot::default()
            };

            for member in load_table::<super::Member>(&tx, MEMBERS)? {
                snapshot.members.insert(member.id, member);
            }
            for group in load_table::<super::Group>(&tx, GROUPS)? {
                snapshot.groups.insert(group.name.clone(), group);
            }
            for project in load_table::<super::Project>(&tx, PROJECTS)? {
                snapshot.projects.insert(project.name.clone(), project);
            }
            for pool in load_table::<super::StoragePool>(&tx, POOLS)? {
                snapshot.pools.insert(pool.name.clone(), pool);
            }
            for token in load_table::<super::TokenRecord>(&tx, TOKENS)? {
                snapshot.tokens.insert(token.server_name.clone(), token);
            }
            for resource in load_table::<super::Resource>(&tx, RESOURCES)? {
                snapshot.resources.insert(resource.id, resource);
            }

            tx.commit()?;
            Ok(snapshot)
        })
        .await
    }

    async fn commit(&self, base_revision: u64, mutations: Vec<Mutation>) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current = read_revision(&tx)?;
            if current != base_revision {
                return Err(StoreError::Conflict {
                    expected: base_revision,
                    actual: current,
                });
            }

            for mutation in &mutations {
                apply(&tx, mutation)?;
            }

            let next = current + 1;
            let stored = i64::try_from(next)
                .map_err(|_| StoreError::Corrupt(format!("revision {next} overflows")))?;
            tx.execute(
                "UPDATE cluster_state SET revision = ?1 WHERE id = 1",
                params![stored],
            )?;
            tx.commit()?;
            Ok(next)
        })
        .await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoragePool;

    #[tokio::test]
    async fn test_sqlite_store_seeds_default_group() {
        let store = SqliteStore::open_in_memory().unwrap();
        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.revision, 0);
        assert!(snapshot.groups.contains_key(DEFAULT_GROUP));
    }

    #[tokio::test]
    async fn test_sqlite_store_commit_and_conflict() {
        let store = SqliteStore::open_in_memory().unwrap();
        let pool = StoragePool {
            name: "ceph".into(),
            remote: true,
        };

        let revision = store
            .commit(0, vec![Mutation::PutPool(pool.clone())])
            .await
            .unwrap();
        assert_eq!(revision, 1);

        let err = store
            .commit(0, vec![Mutation::PutPool(pool)])
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.revision, 1);
        assert!(snapshot.pools["ceph"].remote);
    }

    #[tokio::test]
    async fn test_sqlite_store_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .commit(
                0,
                vec![Mutation::PutGroup(Group {
                    name: "gpu".into(),
                    description: String::new(),
                })],
            )
            .await
            .unwrap();
        store
            .commit(1, vec![Mutation::DeleteGroup("gpu".into())])
            .await
            .unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert!(!snapshot.groups.contains_key("gpu"));
        assert_eq!(snapshot.revision, 2);
    }
}
