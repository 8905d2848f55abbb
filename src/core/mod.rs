pub mod etl;
pub mod export;
pub mod pipeline;
pub mod runner;
pub mod sync;

pub use crate::domain::model::{
    Checkpoint, CheckpointStatus, EntityKind, EntityStats, ExtractedPage, ImportMetadata,
    ImportReport, ImportedRecord, LoadSummary, RawRecord, StoredRecord, SyncMetadata,
    TransformResult,
};
pub use crate::domain::ports::{BulkWriteResult, PageSource, Pipeline, RecordStore, Storage, WriteOp};
pub use crate::utils::error::Result;
