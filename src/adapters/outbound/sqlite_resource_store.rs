//! SQLite Resource Store
//!
//! Implements ResourceStore on top of a SQLite database file.
//! Blocking rusqlite calls run on the blocking thread pool.

use crate::domain::entities::{Resource, ResourceKey};
use crate::domain::errors::StoreError;
use crate::domain::ports::ResourceStore;
use crate::domain::registry;
use crate::domain::value_objects::ResourceType;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How long a write waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_millis(1_000);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS resources (
        type    TEXT NOT NULL,
        mesh    TEXT NOT NULL DEFAULT '',
        name    TEXT NOT NULL,
        spec    TEXT NOT NULL,
        labels  TEXT NOT NULL,
        version INTEGER NOT NULL,
        PRIMARY KEY (type, mesh, name)
    );
    CREATE TABLE IF NOT EXISTS store_meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS revision (
        id    INTEGER PRIMARY KEY CHECK (id = 1),
        value INTEGER NOT NULL
    );
    INSERT OR IGNORE INTO revision (id, value) VALUES (1, 0);
";

/// SQLite-backed resource store.
///
/// The store id is persisted with the data, so it survives restarts and
/// changes only when the database is recreated.
pub struct SqliteResourceStore {
    conn: Arc<Mutex<Connection>>,
    store_id: String,
}

impl SqliteResourceStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;

        let existing: Option<String> = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'store_id'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let store_id = match existing {
            Some(id) => id,
            None => {
                let id = format!("sqlite-{}", uuid::Uuid::new_v4());
                conn.execute(
                    "INSERT INTO store_meta (key, value) VALUES ('store_id', ?1)",
                    params![id],
                )?;
                id
            }
        };

        tracing::info!("sqlite resource store ready, store_id={}", store_id);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            store_id,
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        match tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        {
            Ok(result) => result,
            Err(e) => Err(StoreError::Unavailable(format!("spawn_blocking error: {}", e))),
        }
    }

    fn next_revision(tx: &Transaction<'_>) -> Result<u64, StoreError> {
        tx.execute("UPDATE revision SET value = value + 1 WHERE id = 1", [])?;
        let value: i64 = tx.query_row("SELECT value FROM revision WHERE id = 1", [], |row| {
            row.get(0)
        })?;
        Ok(value as u64)
    }

    fn stored_version(tx: &Transaction<'_>, key: &ResourceKey) -> Result<Option<u64>, StoreError> {
        let version: Option<i64> = tx
            .query_row(
                "SELECT version FROM resources WHERE type = ?1 AND mesh = ?2 AND name = ?3",
                params![key.resource_type.as_str(), mesh_column(&key.mesh), key.name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(|v| v as u64))
    }

    /// Convert a SQLite row to a Resource.
    fn row_to_resource(row: &Row) -> rusqlite::Result<RawResource> {
        Ok(RawResource {
            resource_type: row.get(0)?,
            mesh: row.get(1)?,
            name: row.get(2)?,
            spec: row.get(3)?,
            labels: row.get(4)?,
            version: row.get(5)?,
        })
    }
}

/// Row contents before payload decoding.
struct RawResource {
    resource_type: String,
    mesh: String,
    name: String,
    spec: String,
    labels: String,
    version: i64,
}

impl RawResource {
    fn decode(self) -> Result<Resource, StoreError> {
        let resource_type = ResourceType::parse(&self.resource_type).ok_or_else(|| {
            StoreError::Invalid(format!("unknown resource type {}", self.resource_type))
        })?;
        let spec = registry::descriptor(resource_type).decode_spec(&self.spec)?;
        let labels: BTreeMap<String, String> = serde_json::from_str(&self.labels)
            .map_err(|e| StoreError::Invalid(format!("labels: {}", e)))?;

        Ok(Resource {
            resource_type,
            mesh: if self.mesh.is_empty() {
                None
            } else {
                Some(self.mesh)
            },
            name: self.name,
            spec,
            labels,
            version: self.version as u64,
        })
    }
}

/// Globally scoped resources are stored under the empty mesh.
fn mesh_column(mesh: &Option<String>) -> &str {
    mesh.as_deref().unwrap_or("")
}

fn encode(resource: &Resource) -> Result<(String, String), StoreError> {
    let spec = serde_json::to_string(&resource.spec)
        .map_err(|e| StoreError::Invalid(format!("spec: {}", e)))?;
    let labels = serde_json::to_string(&resource.labels)
        .map_err(|e| StoreError::Invalid(format!("labels: {}", e)))?;
    Ok((spec, labels))
}

#[async_trait]
impl ResourceStore for SqliteResourceStore {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<Resource>, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    "SELECT type, mesh, name, spec, labels, version FROM resources
                     WHERE type = ?1 AND mesh = ?2 AND name = ?3",
                    params![key.resource_type.as_str(), mesh_column(&key.mesh), key.name],
                    Self::row_to_resource,
                )
                .optional()?;
            raw.map(RawResource::decode).transpose()
        })
        .await
    }

    async fn list(
        &self,
        resource_type: ResourceType,
        mesh: Option<&str>,
    ) -> Result<Vec<Resource>, StoreError> {
        let mesh = mesh.map(|m| m.to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT type, mesh, name, spec, labels, version FROM resources
                 WHERE type = ?1 AND (?2 IS NULL OR mesh = ?2)
                 ORDER BY mesh, name",
            )?;
            let rows = stmt
                .query_map(params![resource_type.as_str(), mesh], Self::row_to_resource)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(RawResource::decode).collect()
        })
        .await
    }

    async fn create(&self, mut resource: Resource) -> Result<Resource, StoreError> {
        registry::validate(&resource)?;
        let (spec, labels) = encode(&resource)?;

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let key = resource.key();
            if Self::stored_version(&tx, &key)?.is_some() {
                return Err(StoreError::AlreadyExists(key.to_string()));
            }

            let version = Self::next_revision(&tx)?;
            tx.execute(
                "INSERT INTO resources (type, mesh, name, spec, labels, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    resource.resource_type.as_str(),
                    mesh_column(&resource.mesh),
                    resource.name,
                    spec,
                    labels,
                    version as i64
                ],
            )?;
            tx.commit()?;

            resource.version = version;
            Ok(resource)
        })
        .await
    }

    async fn update(&self, mut resource: Resource) -> Result<Resource, StoreError> {
        registry::validate(&resource)?;
        let (spec, labels) = encode(&resource)?;

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let key = resource.key();
            let stored = Self::stored_version(&tx, &key)?
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            if stored != resource.version {
                return Err(StoreError::Conflict {
                    key: key.to_string(),
                    expected: resource.version,
                    actual: stored,
                });
            }

            let version = Self::next_revision(&tx)?;
            tx.execute(
                "UPDATE resources SET spec = ?1, labels = ?2, version = ?3
                 WHERE type = ?4 AND mesh = ?5 AND name = ?6 AND version = ?7",
                params![
                    spec,
                    labels,
                    version as i64,
                    resource.resource_type.as_str(),
                    mesh_column(&resource.mesh),
                    resource.name,
                    stored as i64
                ],
            )?;
            tx.commit()?;

            resource.version = version;
            Ok(resource)
        })
        .await
    }

    async fn delete(&self, key: &ResourceKey) -> Result<u64, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let removed = tx.execute(
                "DELETE FROM resources WHERE type = ?1 AND mesh = ?2 AND name = ?3",
                params![key.resource_type.as_str(), mesh_column(&key.mesh), key.name],
            )?;
            if removed == 0 {
                return Err(StoreError::NotFound(key.to_string()));
            }
            let version = Self::next_revision(&tx)?;
            tx.commit()?;
            Ok(version)
        })
        .await
    }
}
