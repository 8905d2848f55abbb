use crate::core::{EntityKind, RecordStore, Result, Storage, StoredRecord};
use crate::utils::error::ImportError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use zip::write::FileOptions;
use zip::ZipWriter;

const CSV_HEADER: [&str; 7] = [
    "orgmeter_id",
    "display_name",
    "needs_sync",
    "last_synced_at",
    "sync_id",
    "created_at",
    "imported_at",
];

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub funder: String,
    pub exported_at: DateTime<Utc>,
    /// Record count per collection. Empty entities are left out of the archive.
    pub collections: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub path: String,
    pub summary: ExportSummary,
}

/// Writes a funder's stored records as a zip of CSV and JSON files.
pub struct Exporter<S: RecordStore, W: Storage> {
    store: S,
    storage: W,
}

impl<S: RecordStore, W: Storage> Exporter<S, W> {
    pub fn new(store: S, storage: W) -> Self {
        Self { store, storage }
    }

    pub fn archive_name(funder: &str, at: DateTime<Utc>) -> String {
        format!("orgmeter_{}_{}.zip", funder, at.format("%Y%m%dT%H%M%SZ"))
    }

    pub async fn export(&self, funder: &str, entities: &[EntityKind]) -> Result<ExportOutcome> {
        let exported_at = Utc::now();
        let entities = if entities.is_empty() {
            EntityKind::ALL.to_vec()
        } else {
            entities.to_vec()
        };

        let mut tables = Vec::new();
        for entity in entities {
            let records = self.store.list_records(funder, entity).await?;
            if records.is_empty() {
                tracing::debug!("Skipping {}/{}: no records", funder, entity);
                continue;
            }
            tables.push((entity, records));
        }

        let summary = ExportSummary {
            funder: funder.to_string(),
            exported_at,
            collections: tables
                .iter()
                .map(|(entity, records)| (entity.collection(), records.len()))
                .collect(),
        };

        let zip_data = build_archive(&tables, &summary)?;
        let path = Self::archive_name(funder, exported_at);
        tracing::debug!("Writing ZIP file ({} bytes) to storage", zip_data.len());
        self.storage.write_file(&path, &zip_data).await?;

        tracing::info!(
            "📦 Exported {} collection(s) for {} to {}",
            summary.collections.len(),
            funder,
            path
        );
        Ok(ExportOutcome { path, summary })
    }
}

fn build_archive(
    tables: &[(EntityKind, Vec<StoredRecord>)],
    summary: &ExportSummary,
) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));

    for (entity, records) in tables {
        let collection = entity.collection();

        zip.start_file::<_, ()>(format!("{}.csv", collection), FileOptions::default())?;
        zip.write_all(&records_to_csv(records)?)?;

        zip.start_file::<_, ()>(format!("{}.json", collection), FileOptions::default())?;
        zip.write_all(serde_json::to_string_pretty(records)?.as_bytes())?;
    }

    zip.start_file::<_, ()>("summary.json", FileOptions::default())?;
    zip.write_all(serde_json::to_string_pretty(summary)?.as_bytes())?;

    let cursor = zip.finish()?;
    Ok(cursor.into_inner())
}

fn records_to_csv(records: &[StoredRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;

    for record in records {
        writer.write_record([
            record.orgmeter_id.clone(),
            record.display_name.clone().unwrap_or_default(),
            record.needs_sync.to_string(),
            record
                .last_synced_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            record.sync_id.clone().unwrap_or_default(),
            record.created_at.to_rfc3339(),
            record.imported_at.to_rfc3339(),
        ])?;
    }

    writer.into_inner().map_err(|e| ImportError::ProcessingError {
        message: format!("failed to finish CSV output: {}", e),
    })
}
