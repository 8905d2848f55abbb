//! SQLite-backed record store.
//!
//! One `imported_records` row per funder × entity × OrgMeter id, plus an
//! `import_checkpoints` row per funder × entity. Blocking rusqlite calls run on
//! the tokio blocking pool behind a shared connection.

use crate::domain::model::{
    Checkpoint, CheckpointStatus, EntityKind, EntityStats, StoredRecord,
};
use crate::domain::ports::{BulkWriteResult, RecordStore, WriteOp};
use crate::utils::error::{ImportError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/001_baseline.sql"),
}];

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [migration.version],
        )?;
        tracing::debug!("Applied store migration v{}", migration.version);
    }
    Ok(())
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| ImportError::ProcessingError {
                message: "store connection lock poisoned".to_string(),
            })?;
            f(&mut guard)
        })
        .await?
    }
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339()
}

fn parse_ts(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ImportError::ProcessingError {
            message: format!("invalid timestamp in {}: {} ({})", field, value, e),
        })
}

fn parse_entity(value: &str) -> Result<EntityKind> {
    value
        .parse()
        .map_err(|message| ImportError::ProcessingError { message })
}

const RECORD_COLUMNS: &str = "funder, entity, orgmeter_id, display_name, payload, created_at,
     imported_at, needs_sync, last_synced_at, sync_id";

/// Column values as read, before parsing.
struct RecordRow {
    funder: String,
    entity: String,
    orgmeter_id: String,
    display_name: Option<String>,
    payload: String,
    created_at: String,
    imported_at: String,
    needs_sync: bool,
    last_synced_at: Option<String>,
    sync_id: Option<String>,
}

impl RecordRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            funder: row.get(0)?,
            entity: row.get(1)?,
            orgmeter_id: row.get(2)?,
            display_name: row.get(3)?,
            payload: row.get(4)?,
            created_at: row.get(5)?,
            imported_at: row.get(6)?,
            needs_sync: row.get::<_, i64>(7)? != 0,
            last_synced_at: row.get(8)?,
            sync_id: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<StoredRecord> {
        Ok(StoredRecord {
            entity: parse_entity(&self.entity)?,
            payload: serde_json::from_str(&self.payload)?,
            created_at: parse_ts("created_at", &self.created_at)?,
            imported_at: parse_ts("imported_at", &self.imported_at)?,
            last_synced_at: self
                .last_synced_at
                .as_deref()
                .map(|v| parse_ts("last_synced_at", v))
                .transpose()?,
            funder: self.funder,
            orgmeter_id: self.orgmeter_id,
            display_name: self.display_name,
            needs_sync: self.needs_sync,
            sync_id: self.sync_id,
        })
    }
}

fn query_records(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<StoredRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, RecordRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(RecordRow::into_record).collect()
}

fn read_checkpoint(conn: &Connection, funder: &str, entity: EntityKind) -> Result<Option<Checkpoint>> {
    let row = conn
        .query_row(
            "SELECT last_page, records_seen, status, updated_at
             FROM import_checkpoints WHERE funder = ?1 AND entity = ?2",
            params![funder, entity.as_str()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    row.map(|(last_page, records_seen, status, updated_at)| -> Result<Checkpoint> {
        Ok(Checkpoint {
            funder: funder.to_string(),
            entity,
            last_page: last_page.max(0) as u32,
            records_seen: records_seen.max(0) as u64,
            status: status
                .parse::<CheckpointStatus>()
                .map_err(|message| ImportError::ProcessingError { message })?,
            updated_at: parse_ts("updated_at", &updated_at)?,
        })
    })
    .transpose()
}

impl RecordStore for SqliteStore {
    async fn existing_payloads(
        &self,
        funder: &str,
        entity: EntityKind,
        ids: &[String],
    ) -> Result<HashMap<String, serde_json::Value>> {
        let funder = funder.to_string();
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT payload FROM imported_records
                 WHERE funder = ?1 AND entity = ?2 AND orgmeter_id = ?3",
            )?;
            let mut found = HashMap::new();
            for id in ids {
                let payload: Option<String> = stmt
                    .query_row(params![funder, entity.as_str(), id], |row| row.get(0))
                    .optional()?;
                if let Some(payload) = payload {
                    found.insert(id, serde_json::from_str(&payload)?);
                }
            }
            Ok(found)
        })
        .await
    }

    async fn bulk_write(&self, ops: Vec<WriteOp>) -> Result<BulkWriteResult> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut result = BulkWriteResult::default();
            {
                let mut insert = tx.prepare_cached(
                    "INSERT INTO imported_records
                        (funder, entity, orgmeter_id, collection, display_name, payload,
                         source, created_at, imported_at, needs_sync)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9)
                     ON CONFLICT(funder, entity, orgmeter_id) DO UPDATE SET
                        display_name = excluded.display_name,
                        payload = excluded.payload,
                        imported_at = excluded.imported_at,
                        needs_sync = excluded.needs_sync",
                )?;
                let mut update = tx.prepare_cached(
                    "UPDATE imported_records SET
                        display_name = ?4,
                        payload = ?5,
                        imported_at = ?6,
                        needs_sync = ?7
                     WHERE funder = ?1 AND entity = ?2 AND orgmeter_id = ?3",
                )?;

                for op in &ops {
                    match op {
                        WriteOp::Insert(record) => {
                            insert.execute(params![
                                record.import_metadata.funder,
                                record.entity.as_str(),
                                record.orgmeter_id,
                                record.entity.collection(),
                                record.display_name,
                                record.payload_json()?,
                                record.import_metadata.source,
                                ts(&record.import_metadata.imported_at),
                                record.sync_metadata.needs_sync as i64,
                            ])?;
                            result.inserted += 1;
                        }
                        WriteOp::Update(record) => {
                            let changed = update.execute(params![
                                record.import_metadata.funder,
                                record.entity.as_str(),
                                record.orgmeter_id,
                                record.display_name,
                                record.payload_json()?,
                                ts(&record.import_metadata.imported_at),
                                record.sync_metadata.needs_sync as i64,
                            ])?;
                            result.updated += changed;
                        }
                    }
                }
            }
            tx.commit()?;
            Ok(result)
        })
        .await
    }

    async fn load_checkpoint(&self, funder: &str, entity: EntityKind) -> Result<Option<Checkpoint>> {
        let funder = funder.to_string();
        self.with_conn(move |conn| read_checkpoint(conn, &funder, entity))
            .await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let checkpoint = checkpoint.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO import_checkpoints
                    (funder, entity, last_page, records_seen, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(funder, entity) DO UPDATE SET
                    last_page = excluded.last_page,
                    records_seen = excluded.records_seen,
                    status = excluded.status,
                    updated_at = excluded.updated_at",
                params![
                    checkpoint.funder,
                    checkpoint.entity.as_str(),
                    checkpoint.last_page as i64,
                    checkpoint.records_seen as i64,
                    checkpoint.status.as_str(),
                    ts(&checkpoint.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn clear_checkpoint(&self, funder: &str, entity: EntityKind) -> Result<()> {
        let funder = funder.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM import_checkpoints WHERE funder = ?1 AND entity = ?2",
                params![funder, entity.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    async fn pending_sync(
        &self,
        funder: &str,
        entity: EntityKind,
        limit: usize,
    ) -> Result<Vec<StoredRecord>> {
        let funder = funder.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM imported_records
                 WHERE funder = ?1 AND entity = ?2 AND needs_sync = 1
                 ORDER BY imported_at ASC, orgmeter_id ASC
                 LIMIT ?3",
                RECORD_COLUMNS
            );
            query_records(
                conn,
                &sql,
                &[&funder, &entity.as_str(), &(limit.min(i64::MAX as usize) as i64)],
            )
        })
        .await
    }

    async fn mark_synced(
        &self,
        funder: &str,
        entity: EntityKind,
        orgmeter_id: &str,
        sync_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let funder = funder.to_string();
        let orgmeter_id = orgmeter_id.to_string();
        let sync_id = sync_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE imported_records SET
                    needs_sync = 0,
                    last_synced_at = ?4,
                    sync_id = ?5
                 WHERE funder = ?1 AND entity = ?2 AND orgmeter_id = ?3",
                params![funder, entity.as_str(), orgmeter_id, ts(&at), sync_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn list_records(&self, funder: &str, entity: EntityKind) -> Result<Vec<StoredRecord>> {
        let funder = funder.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM imported_records
                 WHERE funder = ?1 AND entity = ?2
                 ORDER BY orgmeter_id ASC",
                RECORD_COLUMNS
            );
            query_records(conn, &sql, &[&funder, &entity.as_str()])
        })
        .await
    }

    async fn entity_stats(&self, funder: &str) -> Result<Vec<EntityStats>> {
        let funder = funder.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT COUNT(*), COALESCE(SUM(needs_sync), 0)
                 FROM imported_records WHERE funder = ?1 AND entity = ?2",
            )?;
            let mut stats = Vec::with_capacity(EntityKind::ALL.len());
            for entity in EntityKind::ALL {
                let (total, pending): (i64, i64) = stmt
                    .query_row(params![funder, entity.as_str()], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?;
                stats.push(EntityStats {
                    entity,
                    total: total.max(0) as u64,
                    pending_sync: pending.max(0) as u64,
                    checkpoint: read_checkpoint(conn, &funder, entity)?,
                });
            }
            Ok(stats)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{ImportMetadata, ImportedRecord, SyncMetadata};
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    fn record(funder: &str, entity: EntityKind, id: &str, name: &str) -> ImportedRecord {
        let mut payload = serde_json::Map::new();
        payload.insert("id".to_string(), serde_json::json!(id));
        payload.insert("name".to_string(), serde_json::json!(name));
        ImportedRecord {
            entity,
            orgmeter_id: id.to_string(),
            display_name: Some(name.to_string()),
            payload,
            import_metadata: ImportMetadata::new(funder, Utc::now()),
            sync_metadata: SyncMetadata::default(),
        }
    }

    #[tokio::test]
    async fn test_insert_then_read_back_scoped_by_funder() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store
            .bulk_write(vec![
                WriteOp::Insert(record("acme", EntityKind::Merchant, "1", "Joe's Pizza")),
                WriteOp::Insert(record("acme", EntityKind::Merchant, "2", "Blue Cafe")),
                WriteOp::Insert(record("beta", EntityKind::Merchant, "1", "Other Pizza")),
            ])
            .await
            .unwrap();
        assert_eq!(result.inserted, 3);

        let acme = store.list_records("acme", EntityKind::Merchant).await.unwrap();
        assert_eq!(acme.len(), 2);
        assert_eq!(acme[0].display_name.as_deref(), Some("Joe's Pizza"));
        assert!(acme[0].needs_sync);
        assert_eq!(acme[0].payload["name"], "Joe's Pizza");

        let existing = store
            .existing_payloads(
                "beta",
                EntityKind::Merchant,
                &["1".to_string(), "2".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(existing.len(), 1);
        assert_eq!(existing["1"]["name"], "Other Pizza");
    }

    #[tokio::test]
    async fn test_update_preserves_sync_fields_and_created_at() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .bulk_write(vec![WriteOp::Insert(record("acme", EntityKind::Iso, "7", "Old ISO"))])
            .await
            .unwrap();
        let synced_at = Utc::now();
        assert!(store
            .mark_synced("acme", EntityKind::Iso, "7", "crm-iso-7", synced_at)
            .await
            .unwrap());
        let before = store.list_records("acme", EntityKind::Iso).await.unwrap();

        let result = store
            .bulk_write(vec![WriteOp::Update(record("acme", EntityKind::Iso, "7", "New ISO"))])
            .await
            .unwrap();
        assert_eq!(result.updated, 1);

        let after = store.list_records("acme", EntityKind::Iso).await.unwrap();
        assert_eq!(after[0].display_name.as_deref(), Some("New ISO"));
        assert!(after[0].needs_sync);
        assert_eq!(after[0].sync_id.as_deref(), Some("crm-iso-7"));
        assert!(after[0].last_synced_at.is_some());
        assert_eq!(after[0].created_at, before[0].created_at);
    }

    #[tokio::test]
    async fn test_mark_synced_and_pending() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .bulk_write(vec![
                WriteOp::Insert(record("acme", EntityKind::Contact, "a", "Ann")),
                WriteOp::Insert(record("acme", EntityKind::Contact, "b", "Bob")),
            ])
            .await
            .unwrap();

        assert_eq!(
            store.pending_sync("acme", EntityKind::Contact, 10).await.unwrap().len(),
            2
        );
        assert!(store
            .mark_synced("acme", EntityKind::Contact, "a", "crm-1", Utc::now())
            .await
            .unwrap());
        assert!(!store
            .mark_synced("acme", EntityKind::Contact, "zzz", "crm-2", Utc::now())
            .await
            .unwrap());

        let pending = store.pending_sync("acme", EntityKind::Contact, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].orgmeter_id, "b");

        let limited = store.pending_sync("acme", EntityKind::Contact, 0).await.unwrap();
        assert!(limited.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip_and_clear() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store
            .load_checkpoint("acme", EntityKind::Advance)
            .await
            .unwrap()
            .is_none());

        let cp = Checkpoint {
            funder: "acme".to_string(),
            entity: EntityKind::Advance,
            last_page: 3,
            records_seen: 300,
            status: CheckpointStatus::InProgress,
            updated_at: Utc::now(),
        };
        assert_ok!(store.save_checkpoint(&cp).await);

        let loaded = store
            .load_checkpoint("acme", EntityKind::Advance)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.last_page, 3);
        assert_eq!(loaded.status, CheckpointStatus::InProgress);

        assert_ok!(store.clear_checkpoint("acme", EntityKind::Advance).await);
        assert!(store
            .load_checkpoint("acme", EntityKind::Advance)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_entity_stats() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .bulk_write(vec![
                WriteOp::Insert(record("acme", EntityKind::User, "u1", "Uma")),
                WriteOp::Insert(record("acme", EntityKind::User, "u2", "Uri")),
            ])
            .await
            .unwrap();
        store
            .mark_synced("acme", EntityKind::User, "u1", "crm-u1", Utc::now())
            .await
            .unwrap();

        let stats = store.entity_stats("acme").await.unwrap();
        assert_eq!(stats.len(), EntityKind::ALL.len());
        let users = stats.iter().find(|s| s.entity == EntityKind::User).unwrap();
        assert_eq!(users.total, 2);
        assert_eq!(users.pending_sync, 1);
        let merchants = stats
            .iter()
            .find(|s| s.entity == EntityKind::Merchant)
            .unwrap();
        assert_eq!(merchants.total, 0);
    }

    #[tokio::test]
    async fn test_open_file_creates_parent_and_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("sync.db");

        {
            let store = SqliteStore::open(&db_path).unwrap();
            store
                .bulk_write(vec![WriteOp::Insert(record(
                    "acme",
                    EntityKind::Syndicator,
                    "s1",
                    "Syn One",
                ))])
                .await
                .unwrap();
        }

        let reopened = SqliteStore::open(&db_path).unwrap();
        let rows = reopened
            .list_records("acme", EntityKind::Syndicator)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
