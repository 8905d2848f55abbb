use crate::config::toml_config::{ConflictPolicy, EntityConfig};
use crate::core::{
    Checkpoint, EntityKind, ExtractedPage, ImportMetadata, ImportedRecord, LoadSummary,
    PageSource, Pipeline, RawRecord, RecordStore, SyncMetadata, TransformResult, WriteOp,
};
use crate::utils::error::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub conflict_policy: ConflictPolicy,
    pub field_mapping: HashMap<String, String>,
    pub filters: HashMap<String, serde_json::Value>,
}

impl PipelineSettings {
    pub fn new(batch_size: usize, conflict_policy: ConflictPolicy, entity: EntityConfig) -> Self {
        Self {
            batch_size: batch_size.max(1),
            conflict_policy,
            field_mapping: entity.field_mapping.unwrap_or_default(),
            filters: entity.filters.unwrap_or_default(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            conflict_policy: ConflictPolicy::default(),
            field_mapping: HashMap::new(),
            filters: HashMap::new(),
        }
    }
}

/// Imports one entity kind for one funder.
pub struct OrgMeterPipeline<S: RecordStore, P: PageSource> {
    funder: String,
    entity: EntityKind,
    store: Arc<S>,
    source: Arc<P>,
    settings: PipelineSettings,
}

impl<S: RecordStore, P: PageSource> OrgMeterPipeline<S, P> {
    pub fn new(
        funder: impl Into<String>,
        entity: EntityKind,
        store: Arc<S>,
        source: Arc<P>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            funder: funder.into(),
            entity,
            store,
            source,
            settings,
        }
    }

    /// Chunk-level insert/update/skip decision against what is already stored.
    async fn plan_chunk(&self, chunk: Vec<ImportedRecord>) -> Result<(Vec<WriteOp>, usize)> {
        let chunk = dedupe_last_wins(chunk);
        let ids: Vec<String> = chunk.iter().map(|r| r.orgmeter_id.clone()).collect();
        let existing = self
            .store
            .existing_payloads(&self.funder, self.entity, &ids)
            .await?;

        let mut ops = Vec::with_capacity(chunk.len());
        let mut unchanged = 0;

        for record in chunk {
            match existing.get(&record.orgmeter_id) {
                None => ops.push(WriteOp::Insert(record)),
                Some(stored) => match self.settings.conflict_policy {
                    ConflictPolicy::SkipExisting => unchanged += 1,
                    ConflictPolicy::Overwrite => ops.push(WriteOp::Update(record)),
                    ConflictPolicy::UpdateIfChanged => {
                        if stored.as_object() == Some(&record.payload) {
                            unchanged += 1;
                        } else {
                            ops.push(WriteOp::Update(record));
                        }
                    }
                },
            }
        }

        Ok((ops, unchanged))
    }
}

/// Keeps the last occurrence of each OrgMeter id, in order of those occurrences.
fn dedupe_last_wins(records: Vec<ImportedRecord>) -> Vec<ImportedRecord> {
    let mut last_index: HashMap<String, usize> = HashMap::new();
    for (index, record) in records.iter().enumerate() {
        last_index.insert(record.orgmeter_id.clone(), index);
    }
    records
        .into_iter()
        .enumerate()
        .filter(|(index, record)| last_index.get(&record.orgmeter_id) == Some(index))
        .map(|(_, record)| record)
        .collect()
}

#[derive(Debug, PartialEq)]
pub enum MapOutcome {
    Accepted(Box<ImportedRecord>),
    Rejected(String),
    Filtered,
}

/// Maps one raw OrgMeter object into an imported record.
pub fn map_record(
    funder: &str,
    entity: EntityKind,
    raw: RawRecord,
    settings: &PipelineSettings,
    imported_at: DateTime<Utc>,
) -> MapOutcome {
    let serde_json::Value::Object(obj) = raw else {
        return MapOutcome::Rejected("record is not a JSON object".to_string());
    };

    let Some(orgmeter_id) = extract_id(&obj) else {
        return MapOutcome::Rejected("record has no usable id".to_string());
    };

    let matches_filters = settings
        .filters
        .iter()
        .all(|(key, expected)| obj.get(key) == Some(expected));
    if !matches_filters {
        return MapOutcome::Filtered;
    }

    // Renamed values overwrite a raw key of the same name.
    let mut payload = serde_json::Map::new();
    let mut renamed = Vec::new();
    for (key, value) in obj {
        match settings.field_mapping.get(&key) {
            Some(target) => renamed.push((target.clone(), value)),
            None => {
                payload.insert(key, value);
            }
        }
    }
    payload.extend(renamed);

    let display_name = display_name_of(entity, &payload);

    MapOutcome::Accepted(Box::new(ImportedRecord {
        entity,
        orgmeter_id,
        display_name,
        payload,
        import_metadata: ImportMetadata::new(funder, imported_at),
        sync_metadata: SyncMetadata::default(),
    }))
}

fn extract_id(obj: &serde_json::Map<String, serde_json::Value>) -> Option<String> {
    ["id", "_id", "uuid"].iter().find_map(|key| match obj.get(*key)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn non_empty_str<'a>(
    payload: &'a serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn display_name_of(
    entity: EntityKind,
    payload: &serde_json::Map<String, serde_json::Value>,
) -> Option<String> {
    if let Some(name) = entity
        .display_candidates()
        .iter()
        .find_map(|key| non_empty_str(payload, key))
    {
        return Some(name.to_string());
    }

    if !entity.is_person() {
        return None;
    }

    let parts: Vec<&str> = ["first_name", "last_name"]
        .iter()
        .filter_map(|key| non_empty_str(payload, key))
        .collect();
    if !parts.is_empty() {
        return Some(parts.join(" "));
    }
    non_empty_str(payload, "email").map(str::to_string)
}

#[async_trait::async_trait]
impl<S: RecordStore, P: PageSource> Pipeline for OrgMeterPipeline<S, P> {
    fn funder(&self) -> &str {
        &self.funder
    }

    fn entity(&self) -> EntityKind {
        self.entity
    }

    fn batch_size(&self) -> usize {
        self.settings.batch_size
    }

    async fn resume_point(&self) -> Result<Option<Checkpoint>> {
        self.store.load_checkpoint(&self.funder, self.entity).await
    }

    async fn extract(&self, page: u32) -> Result<ExtractedPage> {
        self.source.fetch_page(self.entity, page).await
    }

    async fn transform(&self, page: ExtractedPage) -> Result<TransformResult> {
        let imported_at = Utc::now();
        let mut result = TransformResult::default();

        for raw in page.records {
            match map_record(&self.funder, self.entity, raw, &self.settings, imported_at) {
                MapOutcome::Accepted(record) => result.records.push(*record),
                MapOutcome::Rejected(reason) => {
                    tracing::warn!(
                        "⚠️ {}/{} page {}: skipped record ({})",
                        self.funder,
                        self.entity,
                        page.page,
                        reason
                    );
                    result.rejected += 1;
                }
                MapOutcome::Filtered => result.filtered += 1,
            }
        }

        Ok(result)
    }

    async fn load(&self, records: Vec<ImportedRecord>) -> Result<LoadSummary> {
        let mut summary = LoadSummary::default();
        let mut remaining = records.into_iter();

        loop {
            let chunk: Vec<ImportedRecord> =
                remaining.by_ref().take(self.settings.batch_size).collect();
            if chunk.is_empty() {
                break;
            }

            let (ops, unchanged) = self.plan_chunk(chunk).await?;
            summary.unchanged += unchanged;

            if !ops.is_empty() {
                tracing::debug!(
                    "💾 {}/{}: bulk writing {} records",
                    self.funder,
                    self.entity,
                    ops.len()
                );
                let written = self.store.bulk_write(ops).await?;
                summary.inserted += written.inserted;
                summary.updated += written.updated;
                summary.batches += 1;
            }
        }

        Ok(summary)
    }

    async fn checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.store.save_checkpoint(checkpoint).await
    }
}
