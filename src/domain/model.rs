use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Record types imported from OrgMeter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Merchant,
    Iso,
    Advance,
    Syndicator,
    Contact,
    User,
}

impl EntityKind {
    /// Import order. Parents (merchants, ISOs) land before the advances that reference them.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Merchant,
        EntityKind::Iso,
        EntityKind::Advance,
        EntityKind::Syndicator,
        EntityKind::Contact,
        EntityKind::User,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Merchant => "merchant",
            EntityKind::Iso => "iso",
            EntityKind::Advance => "advance",
            EntityKind::Syndicator => "syndicator",
            EntityKind::Contact => "contact",
            EntityKind::User => "user",
        }
    }

    pub fn default_path(&self) -> &'static str {
        match self {
            EntityKind::Merchant => "merchants",
            EntityKind::Iso => "isos",
            EntityKind::Advance => "advances",
            EntityKind::Syndicator => "syndicators",
            EntityKind::Contact => "contacts",
            EntityKind::User => "users",
        }
    }

    /// Name of the CRM collection the records belong to.
    pub fn collection(&self) -> String {
        format!("orgmeter_{}", self.default_path())
    }

    /// Keys tried in order when deriving a human readable label.
    pub fn display_candidates(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Merchant => &["business_name", "dba_name", "legal_name", "name"],
            EntityKind::Iso => &["name", "company_name", "business_name"],
            EntityKind::Advance => &["advance_number", "deal_number", "name", "merchant_name"],
            EntityKind::Syndicator => &["name", "company_name"],
            EntityKind::Contact | EntityKind::User => &["full_name", "name"],
        }
    }

    /// Falls back to `first_name` + `last_name`, then `email`, for a label.
    pub fn is_person(&self) -> bool {
        matches!(self, EntityKind::Contact | EntityKind::User)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        EntityKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == needle || kind.default_path() == needle)
            .ok_or_else(|| format!("unknown entity kind: {}", s))
    }
}

/// A raw JSON value as returned by OrgMeter.
pub type RawRecord = serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMetadata {
    pub funder: String,
    pub source: String,
    pub imported_at: DateTime<Utc>,
}

impl ImportMetadata {
    pub const SOURCE: &'static str = "orgmeter";

    pub fn new(funder: impl Into<String>, imported_at: DateTime<Utc>) -> Self {
        Self {
            funder: funder.into(),
            source: Self::SOURCE.to_string(),
            imported_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub needs_sync: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_id: Option<String>,
}

impl Default for SyncMetadata {
    fn default() -> Self {
        Self {
            needs_sync: true,
            last_synced_at: None,
            sync_id: None,
        }
    }
}

/// A mapped record ready to be written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedRecord {
    pub entity: EntityKind,
    pub orgmeter_id: String,
    pub display_name: Option<String>,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub import_metadata: ImportMetadata,
    pub sync_metadata: SyncMetadata,
}

impl ImportedRecord {
    pub fn payload_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.payload)
    }
}

#[derive(Debug, Clone)]
pub struct ExtractedPage {
    pub page: u32,
    pub records: Vec<RawRecord>,
    pub total_pages: Option<u32>,
    pub is_last: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TransformResult {
    pub records: Vec<ImportedRecord>,
    pub rejected: usize,
    pub filtered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    InProgress,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }
}

impl FromStr for CheckpointStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(CheckpointStatus::InProgress),
            "completed" => Ok(CheckpointStatus::Completed),
            "failed" => Ok(CheckpointStatus::Failed),
            other => Err(format!("unknown checkpoint status: {}", other)),
        }
    }
}

/// Last flushed page for one funder × entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub funder: String,
    pub entity: EntityKind,
    pub last_page: u32,
    pub records_seen: u64,
    pub status: CheckpointStatus,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Page to start from, or `None` when the previous run finished.
    pub fn resume_page(&self) -> Option<u32> {
        match self.status {
            CheckpointStatus::Completed => None,
            CheckpointStatus::InProgress | CheckpointStatus::Failed => Some(self.last_page + 1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub batches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub funder: String,
    pub entity: EntityKind,
    pub pages: u32,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub filtered: usize,
    pub resumed_from: Option<u32>,
    /// False when the run stopped at `max_pages` before the last upstream page.
    pub completed: bool,
    #[serde(serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
}

fn serialize_duration_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// A row read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub funder: String,
    pub entity: EntityKind,
    pub orgmeter_id: String,
    pub display_name: Option<String>,
    pub payload: serde_json::Value,
    /// First time the record was stored.
    pub created_at: DateTime<Utc>,
    /// Last import that wrote the record.
    pub imported_at: DateTime<Utc>,
    pub needs_sync: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityStats {
    pub entity: EntityKind,
    pub total: u64,
    pub pending_sync: u64,
    pub checkpoint: Option<Checkpoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_parsing_accepts_plural_and_case() {
        assert_eq!("Merchant".parse::<EntityKind>().unwrap(), EntityKind::Merchant);
        assert_eq!("isos".parse::<EntityKind>().unwrap(), EntityKind::Iso);
        assert_eq!(" ADVANCES ".parse::<EntityKind>().unwrap(), EntityKind::Advance);
        assert!("lead".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_collection_names() {
        assert_eq!(EntityKind::Syndicator.collection(), "orgmeter_syndicators");
        assert_eq!(EntityKind::User.collection(), "orgmeter_users");
    }

    #[test]
    fn test_new_sync_metadata_needs_sync() {
        let sync = SyncMetadata::default();
        assert!(sync.needs_sync);
        assert!(sync.last_synced_at.is_none());
        assert!(sync.sync_id.is_none());
    }

    #[test]
    fn test_checkpoint_resume_page() {
        let mut cp = Checkpoint {
            funder: "f1".to_string(),
            entity: EntityKind::Merchant,
            last_page: 4,
            records_seen: 400,
            status: CheckpointStatus::InProgress,
            updated_at: Utc::now(),
        };
        assert_eq!(cp.resume_page(), Some(5));
        cp.status = CheckpointStatus::Failed;
        assert_eq!(cp.resume_page(), Some(5));
        cp.status = CheckpointStatus::Completed;
        assert_eq!(cp.resume_page(), None);
    }
}
