// packages/engine/src/checkpoint/sqlite_store.rs
//! Checkpoint storage using SQLite + file system
//!
//! Stores payload metadata and recovery markers in SQLite and compressed
//! payloads in files.

use super::model::{CheckpointRef, RecoveryDescriptor};
use super::store::DurableCheckpointStore;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::InstanceId;
use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};
use ulid::Ulid;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// Base directory for storage
    pub base_dir: PathBuf,

    /// SQLite database file name
    pub db_name: String,

    /// Payload directory name
    pub payload_dir: String,
}

impl SqliteStoreConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./agentcore-checkpoints"),
            db_name: "checkpoints.db".to_string(),
            payload_dir: "payloads".to_string(),
        }
    }
}

/// Durable checkpoint store on local disk
#[derive(Debug)]
pub struct SqliteCheckpointStore {
    config: SqliteStoreConfig,
    db: Mutex<Connection>,
}

fn storage_error(context: &str) -> impl Fn(rusqlite::Error) -> EngineError + '_ {
    move |e| EngineError::StorageFailed(format!("{}: {}", context, e))
}

impl SqliteCheckpointStore {
    /// Open (or create) a store under the configured directory
    pub async fn open(config: SqliteStoreConfig) -> Result<Self> {
        let payload_dir = config.base_dir.join(&config.payload_dir);
        fs::create_dir_all(&payload_dir).await.map_err(|e| {
            EngineError::StorageFailed(format!("Failed to create payload directory: {}", e))
        })?;

        let db_path = config.base_dir.join(&config.db_name);
        let conn = Connection::open(&db_path).map_err(storage_error("Failed to open database"))?;
        Self::init_schema(&conn)?;

        info!("Checkpoint storage initialized at {:?}", config.base_dir);

        Ok(Self {
            config,
            db: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoint_payloads (
                payload_ref TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_payload_instance
                ON checkpoint_payloads(instance_id);
            CREATE TABLE IF NOT EXISTS pending_recovery (
                instance_id TEXT PRIMARY KEY,
                descriptor TEXT NOT NULL,
                marked_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(storage_error("Schema creation failed"))
    }

    fn payload_path(&self, file_name: &str) -> PathBuf {
        self.config
            .base_dir
            .join(&self.config.payload_dir)
            .join(file_name)
    }

    fn query_descriptors(
        conn: &Connection,
        instance_id: Option<&InstanceId>,
    ) -> Result<Vec<String>> {
        let rows: Vec<String> = match instance_id {
            Some(id) => conn
                .query_row(
                    "SELECT descriptor FROM pending_recovery WHERE instance_id = ?",
                    params![id.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(storage_error("Recovery lookup failed"))?
                .into_iter()
                .collect(),
            None => {
                let mut stmt = conn
                    .prepare("SELECT descriptor FROM pending_recovery ORDER BY marked_at")
                    .map_err(storage_error("Query preparation failed"))?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(storage_error("Query execution failed"))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(storage_error("Result collection failed"))?;
                rows
            }
        };
        Ok(rows)
    }
}

#[async_trait]
impl DurableCheckpointStore for SqliteCheckpointStore {
    async fn save(&self, instance_id: &InstanceId, payload: Bytes) -> Result<CheckpointRef> {
        let file_name = format!("{}.zst", Ulid::new().to_string().to_lowercase());
        let file_path = self.payload_path(&file_name);
        let checkpoint_ref = CheckpointRef::new(format!("sqlite://{}", file_name));

        fs::write(&file_path, &payload).await.map_err(|e| {
            EngineError::StorageFailed(format!("Failed to write payload file: {}", e))
        })?;

        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO checkpoint_payloads (payload_ref, instance_id, file_path, size_bytes, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![
                checkpoint_ref.as_str(),
                instance_id.as_str(),
                file_path.to_string_lossy(),
                payload.len() as i64,
                chrono::Utc::now().timestamp_millis(),
            ],
        )
        .map_err(storage_error("Failed to record payload metadata"))?;
        drop(db);

        debug!("Wrote payload {} ({} bytes)", checkpoint_ref, payload.len());
        Ok(checkpoint_ref)
    }

    async fn load(&self, checkpoint_ref: &CheckpointRef) -> Result<Bytes> {
        let db = self.db.lock().await;
        let file_path: Option<String> = db
            .query_row(
                "SELECT file_path FROM checkpoint_payloads WHERE payload_ref = ?",
                params![checkpoint_ref.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_error("Payload lookup failed"))?;
        drop(db);

        let file_path =
            file_path.ok_or_else(|| EngineError::CheckpointNotFound(checkpoint_ref.to_string()))?;

        match fs::read(&file_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(EngineError::CheckpointNotFound(
                format!("{} (payload file missing)", checkpoint_ref),
            )),
            Err(e) => Err(EngineError::StorageFailed(format!(
                "Failed to read payload file: {}",
                e
            ))),
        }
    }

    async fn list_pending_recovery(
        &self,
        instance_id: Option<&InstanceId>,
    ) -> Result<Vec<RecoveryDescriptor>> {
        let db = self.db.lock().await;
        let rows = Self::query_descriptors(&db, instance_id)?;
        drop(db);

        rows.iter()
            .map(|raw| {
                serde_json::from_str(raw).map_err(|e| {
                    EngineError::CheckpointCorrupted(format!("Unreadable recovery marker: {}", e))
                })
            })
            .collect()
    }

    async fn mark_pending_recovery(&self, descriptor: RecoveryDescriptor) -> Result<()> {
        let raw = serde_json::to_string(&descriptor)?;
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO pending_recovery (instance_id, descriptor, marked_at)
            VALUES (?, ?, ?)
            ON CONFLICT(instance_id) DO UPDATE SET
                descriptor = excluded.descriptor,
                marked_at = excluded.marked_at
            "#,
            params![
                descriptor.instance_id.as_str(),
                raw,
                descriptor.marked_at.timestamp_millis(),
            ],
        )
        .map_err(storage_error("Failed to record recovery marker"))?;
        Ok(())
    }

    async fn clear_recovery(&self, instance_id: &InstanceId) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "DELETE FROM pending_recovery WHERE instance_id = ?",
            params![instance_id.as_str()],
        )
        .map_err(storage_error("Failed to clear recovery marker"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::model::{Checkpoint, CheckpointKind};
    use crate::utils::ids::CheckpointId;
    use chrono::Utc;
    use tempfile::TempDir;

    async fn store() -> (SqliteCheckpointStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteCheckpointStore::open(SqliteStoreConfig::new(dir.path()))
            .await
            .unwrap();
        (store, dir)
    }

    fn descriptor(instance_id: &InstanceId, payload_ref: CheckpointRef) -> RecoveryDescriptor {
        let now = Utc::now();
        RecoveryDescriptor {
            instance_id: instance_id.clone(),
            checkpoint: Checkpoint {
                id: CheckpointId::generate(),
                instance_id: instance_id.clone(),
                execution_id: None,
                label: "nightly".to_string(),
                kind: CheckpointKind::Auto,
                payload_ref,
                size_bytes: 5,
                created_at: now,
            },
            marked_at: now,
        }
    }

    #[tokio::test]
    async fn test_payload_round_trip() {
        let (store, _dir) = store().await;
        let id = InstanceId::generate();
        let r = store.save(&id, Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(store.load(&r).await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_missing_payload() {
        let (store, _dir) = store().await;
        let err = store
            .load(&CheckpointRef::new("sqlite://missing.zst"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CheckpointNotFound(_)));
    }

    #[tokio::test]
    async fn test_recovery_markers_replace_and_clear() {
        let (store, _dir) = store().await;
        let id = InstanceId::generate();
        let first = store.save(&id, Bytes::from_static(b"one")).await.unwrap();
        let second = store.save(&id, Bytes::from_static(b"two")).await.unwrap();

        store.mark_pending_recovery(descriptor(&id, first)).await.unwrap();
        store
            .mark_pending_recovery(descriptor(&id, second.clone()))
            .await
            .unwrap();

        let pending = store.list_pending_recovery(Some(&id)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].checkpoint.payload_ref, second);
        assert_eq!(store.list_pending_recovery(None).await.unwrap().len(), 1);

        store.clear_recovery(&id).await.unwrap();
        assert!(store.list_pending_recovery(Some(&id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_markers_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let id = InstanceId::generate();
        {
            let store = SqliteCheckpointStore::open(SqliteStoreConfig::new(dir.path()))
                .await
                .unwrap();
            let r = store.save(&id, Bytes::from_static(b"state")).await.unwrap();
            store.mark_pending_recovery(descriptor(&id, r)).await.unwrap();
        }

        let reopened = SqliteCheckpointStore::open(SqliteStoreConfig::new(dir.path()))
            .await
            .unwrap();
        let pending = reopened.list_pending_recovery(Some(&id)).await.unwrap();
        assert_eq!(pending.len(), 1);
        let payload = reopened.load(&pending[0].checkpoint.payload_ref).await.unwrap();
        assert_eq!(payload, Bytes::from_static(b"state"));
    }
}
