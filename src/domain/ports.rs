use crate::domain::model::{
    Checkpoint, EntityKind, EntityStats, ExtractedPage, ImportedRecord, LoadSummary,
    StoredRecord, TransformResult,
};
use crate::utils::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;

/// Plain file output (exports).
pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(&self, path: &str, data: &[u8]) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone)]
pub enum WriteOp {
    Insert(ImportedRecord),
    /// Replaces payload and import time; keeps `last_synced_at` and `sync_id`.
    Update(ImportedRecord),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteResult {
    pub inserted: usize,
    pub updated: usize,
}

/// Persistence for imported records, partitioned by funder.
pub trait RecordStore: Send + Sync {
    /// Stored payloads for the given OrgMeter ids, keyed by id. Missing ids are absent.
    fn existing_payloads(
        &self,
        funder: &str,
        entity: EntityKind,
        ids: &[String],
    ) -> impl Future<Output = Result<HashMap<String, serde_json::Value>>> + Send;

    /// Applies all ops in a single transaction.
    fn bulk_write(&self, ops: Vec<WriteOp>) -> impl Future<Output = Result<BulkWriteResult>> + Send;

    fn load_checkpoint(
        &self,
        funder: &str,
        entity: EntityKind,
    ) -> impl Future<Output = Result<Option<Checkpoint>>> + Send;

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> impl Future<Output = Result<()>> + Send;

    fn clear_checkpoint(
        &self,
        funder: &str,
        entity: EntityKind,
    ) -> impl Future<Output = Result<()>> + Send;

    fn pending_sync(
        &self,
        funder: &str,
        entity: EntityKind,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<StoredRecord>>> + Send;

    /// Returns `false` when no such record exists.
    fn mark_synced(
        &self,
        funder: &str,
        entity: EntityKind,
        orgmeter_id: &str,
        sync_id: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn list_records(
        &self,
        funder: &str,
        entity: EntityKind,
    ) -> impl Future<Output = Result<Vec<StoredRecord>>> + Send;

    fn entity_stats(&self, funder: &str) -> impl Future<Output = Result<Vec<EntityStats>>> + Send;
}

/// A paginated upstream source of raw records.
pub trait PageSource: Send + Sync {
    fn fetch_page(
        &self,
        entity: EntityKind,
        page: u32,
    ) -> impl Future<Output = Result<ExtractedPage>> + Send;
}

/// One funder × entity import.
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn funder(&self) -> &str;
    fn entity(&self) -> EntityKind;
    fn batch_size(&self) -> usize;
    async fn resume_point(&self) -> Result<Option<Checkpoint>>;
    async fn extract(&self, page: u32) -> Result<ExtractedPage>;
    async fn transform(&self, page: ExtractedPage) -> Result<TransformResult>;
    async fn load(&self, records: Vec<ImportedRecord>) -> Result<LoadSummary>;
    async fn checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    fn name(&self) -> String {
        format!("{}/{}", self.funder(), self.entity())
    }
}
