use crate::core::{EntityKind, RecordStore, Result, StoredRecord};
use crate::utils::error::ImportError;
use chrono::Utc;

/// Records imported or changed since they were last pushed downstream.
pub async fn pending<S: RecordStore>(
    store: &S,
    funder: &str,
    entity: EntityKind,
    limit: usize,
) -> Result<Vec<StoredRecord>> {
    let records = store.pending_sync(funder, entity, limit).await?;
    tracing::debug!("{}/{}: {} record(s) pending sync", funder, entity, records.len());
    Ok(records)
}

/// Clears the pending flag once a downstream system has taken the record.
pub async fn mark_synced<S: RecordStore>(
    store: &S,
    funder: &str,
    entity: EntityKind,
    orgmeter_id: &str,
    sync_id: &str,
) -> Result<()> {
    if orgmeter_id.trim().is_empty() {
        return Err(ImportError::ProcessingError {
            message: "orgmeter id must not be empty".to_string(),
        });
    }

    let found = store
        .mark_synced(funder, entity, orgmeter_id, sync_id, Utc::now())
        .await?;
    if !found {
        return Err(ImportError::NotFoundError {
            funder: funder.to_string(),
            entity: entity.to_string(),
            orgmeter_id: orgmeter_id.to_string(),
        });
    }

    tracing::info!("🔁 {}/{} {} synced as {}", funder, entity, orgmeter_id, sync_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SqliteStore;
    use crate::core::{ImportMetadata, ImportedRecord, SyncMetadata, WriteOp};

    fn record(id: &str) -> ImportedRecord {
        let mut payload = serde_json::Map::new();
        payload.insert("id".to_string(), serde_json::json!(id));
        ImportedRecord {
            entity: EntityKind::Advance,
            orgmeter_id: id.to_string(),
            display_name: None,
            payload,
            import_metadata: ImportMetadata::new("acme", Utc::now()),
            sync_metadata: SyncMetadata::default(),
        }
    }

    #[tokio::test]
    async fn test_mark_synced_removes_from_pending() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .bulk_write(vec![WriteOp::Insert(record("a1")), WriteOp::Insert(record("a2"))])
            .await
            .unwrap();

        assert_eq!(pending(&store, "acme", EntityKind::Advance, 10).await.unwrap().len(), 2);

        mark_synced(&store, "acme", EntityKind::Advance, "a1", "crm-77")
            .await
            .unwrap();

        let remaining = pending(&store, "acme", EntityKind::Advance, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].orgmeter_id, "a2");
    }

    #[tokio::test]
    async fn test_mark_synced_unknown_record_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .bulk_write(vec![WriteOp::Insert(record("a1"))])
            .await
            .unwrap();

        let err = mark_synced(&store, "other", EntityKind::Advance, "a1", "crm-1")
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::NotFoundError { .. }));

        let err = mark_synced(&store, "acme", EntityKind::Advance, " ", "crm-1")
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::ProcessingError { .. }));
    }
}
