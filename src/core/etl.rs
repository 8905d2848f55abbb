use crate::core::{Checkpoint, CheckpointStatus, ImportReport, ImportedRecord, Pipeline};
use crate::utils::error::Result;
use crate::utils::monitor::SystemMonitor;
use chrono::Utc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Pause between page requests.
    pub page_delay: Duration,
    /// Upper bound on pages fetched in one run.
    pub max_pages: Option<u32>,
    /// Ignore any checkpoint and start from page 1.
    pub full_refresh: bool,
}

/// Drives one pipeline page by page: extract, transform, buffer, flush, checkpoint.
pub struct ImportEngine<P: Pipeline> {
    pipeline: P,
    options: EngineOptions,
    monitor: SystemMonitor,
}

/// Progress carried across pages so a failure can still be checkpointed.
struct RunState {
    report: ImportReport,
    records_seen: u64,
    last_flushed_page: u32,
}

impl<P: Pipeline> ImportEngine<P> {
    pub fn new(pipeline: P, options: EngineOptions) -> Self {
        Self::new_with_monitoring(pipeline, options, false)
    }

    pub fn new_with_monitoring(pipeline: P, options: EngineOptions, monitor_enabled: bool) -> Self {
        Self {
            pipeline,
            options,
            monitor: SystemMonitor::new(monitor_enabled),
        }
    }

    pub async fn run(&self) -> Result<ImportReport> {
        let started = Instant::now();
        let name = self.pipeline.name();

        let resume = if self.options.full_refresh {
            None
        } else {
            self.pipeline
                .resume_point()
                .await?
                .and_then(|cp| cp.resume_page().map(|page| (page, cp.records_seen)))
        };
        let start_page = resume.map(|(page, _)| page).unwrap_or(1);

        match resume {
            Some((page, _)) => tracing::info!("🔁 {}: resuming from page {}", name, page),
            None => tracing::info!("🚀 {}: starting import", name),
        }
        self.monitor.log_stats(&format!("{} start", name));

        let mut state = RunState {
            report: ImportReport {
                funder: self.pipeline.funder().to_string(),
                entity: self.pipeline.entity(),
                pages: 0,
                fetched: 0,
                inserted: 0,
                updated: 0,
                unchanged: 0,
                rejected: 0,
                filtered: 0,
                resumed_from: resume.map(|(page, _)| page),
                completed: false,
                duration: Duration::ZERO,
            },
            records_seen: resume.map(|(_, seen)| seen).unwrap_or(0),
            last_flushed_page: start_page - 1,
        };

        if let Err(e) = self.run_pages(start_page, &mut state).await {
            tracing::error!(
                "❌ {}: failed after page {}: {}",
                name,
                state.last_flushed_page,
                e
            );
            if let Err(cp_err) = self
                .pipeline
                .checkpoint(&self.checkpoint_at(&state, CheckpointStatus::Failed))
                .await
            {
                tracing::error!("❌ {}: could not save failed checkpoint: {}", name, cp_err);
            }
            return Err(e);
        }

        if state.report.completed {
            self.pipeline
                .checkpoint(&self.checkpoint_at(&state, CheckpointStatus::Completed))
                .await?;
        }

        state.report.duration = started.elapsed();
        tracing::info!(
            "✅ {}: {} pages, {} fetched, {} inserted, {} updated, {} unchanged, {} rejected, {} filtered in {:?}",
            name,
            state.report.pages,
            state.report.fetched,
            state.report.inserted,
            state.report.updated,
            state.report.unchanged,
            state.report.rejected,
            state.report.filtered,
            state.report.duration
        );
        self.monitor.log_final_stats();

        Ok(state.report)
    }

    async fn run_pages(&self, start_page: u32, state: &mut RunState) -> Result<()> {
        let batch_size = self.pipeline.batch_size().max(1);
        let mut buffer: Vec<ImportedRecord> = Vec::new();
        let mut unflushed_seen: u64 = 0;
        let mut page = start_page;

        loop {
            let extracted = self.pipeline.extract(page).await?;
            let upstream_done = extracted.is_last;
            state.report.pages += 1;
            state.report.fetched += extracted.records.len();
            unflushed_seen += extracted.records.len() as u64;

            let hit_page_limit = self
                .options
                .max_pages
                .is_some_and(|max| state.report.pages >= max);

            let transformed = self.pipeline.transform(extracted).await?;
            state.report.rejected += transformed.rejected;
            state.report.filtered += transformed.filtered;
            buffer.extend(transformed.records);

            let stop = upstream_done || hit_page_limit;
            if buffer.len() >= batch_size || stop {
                let summary = self.pipeline.load(std::mem::take(&mut buffer)).await?;
                state.report.inserted += summary.inserted;
                state.report.updated += summary.updated;
                state.report.unchanged += summary.unchanged;
                state.last_flushed_page = page;
                state.records_seen += std::mem::take(&mut unflushed_seen);

                self.pipeline
                    .checkpoint(&self.checkpoint_at(state, CheckpointStatus::InProgress))
                    .await?;
                self.monitor.log_stats(&format!("{} page {}", self.pipeline.name(), page));
            }

            if stop {
                state.report.completed = upstream_done;
                if !upstream_done {
                    tracing::info!(
                        "⏸️ {}: reached max_pages at page {}, will resume from page {}",
                        self.pipeline.name(),
                        page,
                        page + 1
                    );
                }
                return Ok(());
            }

            if !self.options.page_delay.is_zero() {
                tokio::time::sleep(self.options.page_delay).await;
            }
            page += 1;
        }
    }

    fn checkpoint_at(&self, state: &RunState, status: CheckpointStatus) -> Checkpoint {
        Checkpoint {
            funder: self.pipeline.funder().to_string(),
            entity: self.pipeline.entity(),
            last_page: state.last_flushed_page,
            records_seen: state.records_seen,
            status,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SqliteStore;
    use crate::core::pipeline::{OrgMeterPipeline, PipelineSettings};
    use crate::core::{
        EntityKind, ExtractedPage, LoadSummary, PageSource, RawRecord, RecordStore,
        TransformResult,
    };
    use crate::utils::error::ImportError;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// `total` pages of `per_page` records; optionally fails on one page.
    struct FakeOrgMeter {
        total: u32,
        per_page: u32,
        fail_on: Option<u32>,
        calls: AtomicU32,
    }

    impl FakeOrgMeter {
        fn new(total: u32, per_page: u32) -> Self {
            Self {
                total,
                per_page,
                fail_on: None,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl PageSource for FakeOrgMeter {
        async fn fetch_page(&self, _entity: EntityKind, page: u32) -> Result<ExtractedPage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(page) {
                return Err(ImportError::ApiStatusError {
                    status: 502,
                    url: "fake".to_string(),
                    body: String::new(),
                });
            }
            let records: Vec<RawRecord> = if page > self.total {
                Vec::new()
            } else {
                (0..self.per_page)
                    .map(|i| json!({"id": (page - 1) * self.per_page + i, "name": "m"}))
                    .collect()
            };
            Ok(ExtractedPage {
                page,
                records,
                total_pages: Some(self.total),
                is_last: page >= self.total,
            })
        }
    }

    fn engine(
        store: Arc<SqliteStore>,
        source: Arc<FakeOrgMeter>,
        batch_size: usize,
        options: EngineOptions,
    ) -> ImportEngine<OrgMeterPipeline<SqliteStore, FakeOrgMeter>> {
        let settings = PipelineSettings {
            batch_size,
            ..PipelineSettings::default()
        };
        let pipeline = OrgMeterPipeline::new("acme", EntityKind::Merchant, store, source, settings);
        ImportEngine::new(pipeline, options)
    }

    #[tokio::test]
    async fn test_full_run_imports_all_pages_and_completes() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let source = Arc::new(FakeOrgMeter::new(3, 10));

        let report = engine(store.clone(), source.clone(), 1000, EngineOptions::default())
            .run()
            .await
            .unwrap();

        assert_eq!(report.pages, 3);
        assert_eq!(report.fetched, 30);
        assert_eq!(report.inserted, 30);
        assert!(report.completed);
        assert_eq!(report.resumed_from, None);

        let cp = store
            .load_checkpoint("acme", EntityKind::Merchant)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cp.status, CheckpointStatus::Completed);
        assert_eq!(cp.last_page, 3);
        assert_eq!(cp.records_seen, 30);
    }

    #[tokio::test]
    async fn test_failure_checkpoints_last_flush_and_resume_continues() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut failing = FakeOrgMeter::new(4, 5);
        failing.fail_on = Some(3);

        // batch of 5 flushes after every page
        let err = engine(store.clone(), Arc::new(failing), 5, EngineOptions::default())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::ApiStatusError { status: 502, .. }));

        let cp = store
            .load_checkpoint("acme", EntityKind::Merchant)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cp.status, CheckpointStatus::Failed);
        assert_eq!(cp.last_page, 2);

        let healthy = Arc::new(FakeOrgMeter::new(4, 5));
        let report = engine(store.clone(), healthy.clone(), 5, EngineOptions::default())
            .run()
            .await
            .unwrap();

        assert_eq!(report.resumed_from, Some(3));
        assert_eq!(report.pages, 2);
        assert_eq!(report.inserted, 10);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            store.list_records("acme", EntityKind::Merchant).await.unwrap().len(),
            20
        );
    }

    /// Delegates to `P` but cannot persist `Failed` checkpoints.
    struct FailedCheckpointRejected<P>(P);

    #[async_trait::async_trait]
    impl<P: Pipeline> Pipeline for FailedCheckpointRejected<P> {
        fn funder(&self) -> &str {
            self.0.funder()
        }

        fn entity(&self) -> EntityKind {
            self.0.entity()
        }

        fn batch_size(&self) -> usize {
            self.0.batch_size()
        }

        async fn resume_point(&self) -> Result<Option<Checkpoint>> {
            self.0.resume_point().await
        }

        async fn extract(&self, page: u32) -> Result<ExtractedPage> {
            self.0.extract(page).await
        }

        async fn transform(&self, page: ExtractedPage) -> Result<TransformResult> {
            self.0.transform(page).await
        }

        async fn load(&self, records: Vec<ImportedRecord>) -> Result<LoadSummary> {
            self.0.load(records).await
        }

        async fn checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
            if checkpoint.status == CheckpointStatus::Failed {
                return Err(ImportError::ProcessingError {
                    message: "database is locked".to_string(),
                });
            }
            self.0.checkpoint(checkpoint).await
        }
    }

    #[tokio::test]
    async fn test_import_error_survives_checkpoint_failure() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut failing = FakeOrgMeter::new(3, 2);
        failing.fail_on = Some(2);

        let pipeline = OrgMeterPipeline::new(
            "acme",
            EntityKind::Merchant,
            store.clone(),
            Arc::new(failing),
            PipelineSettings::default(),
        );
        let err = ImportEngine::new(FailedCheckpointRejected(pipeline), EngineOptions::default())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, ImportError::ApiStatusError { status: 502, .. }));
    }

    #[tokio::test]
    async fn test_buffer_flushes_only_at_batch_size() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut failing = FakeOrgMeter::new(5, 4);
        failing.fail_on = Some(4);

        // pages 1-2 (8 records) flush together; page 3 is buffered and lost
        engine(store.clone(), Arc::new(failing), 8, EngineOptions::default())
            .run()
            .await
            .unwrap_err();

        let cp = store
            .load_checkpoint("acme", EntityKind::Merchant)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cp.last_page, 2);
        assert_eq!(
            store.list_records("acme", EntityKind::Merchant).await.unwrap().len(),
            8
        );
    }

    #[tokio::test]
    async fn test_max_pages_leaves_run_resumable() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let options = EngineOptions {
            max_pages: Some(2),
            ..EngineOptions::default()
        };

        let report = engine(store.clone(), Arc::new(FakeOrgMeter::new(3, 2)), 1000, options.clone())
            .run()
            .await
            .unwrap();
        assert!(!report.completed);
        assert_eq!(report.inserted, 4);

        let cp = store
            .load_checkpoint("acme", EntityKind::Merchant)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cp.status, CheckpointStatus::InProgress);

        let report = engine(store.clone(), Arc::new(FakeOrgMeter::new(3, 2)), 1000, options)
            .run()
            .await
            .unwrap();
        assert_eq!(report.resumed_from, Some(3));
        assert!(report.completed);
        assert_eq!(report.inserted, 2);
    }

    #[tokio::test]
    async fn test_full_refresh_ignores_checkpoint() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        engine(store.clone(), Arc::new(FakeOrgMeter::new(2, 3)), 1000, EngineOptions::default())
            .run()
            .await
            .unwrap();

        // completed checkpoint: a normal run starts at page 1 anyway
        let again = engine(store.clone(), Arc::new(FakeOrgMeter::new(2, 3)), 1000, EngineOptions::default())
            .run()
            .await
            .unwrap();
        assert_eq!(again.resumed_from, None);
        assert_eq!(again.unchanged, 6);

        store
            .save_checkpoint(&Checkpoint {
                funder: "acme".to_string(),
                entity: EntityKind::Merchant,
                last_page: 1,
                records_seen: 3,
                status: CheckpointStatus::InProgress,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let options = EngineOptions {
            full_refresh: true,
            ..EngineOptions::default()
        };
        let source = Arc::new(FakeOrgMeter::new(2, 3));
        let report = engine(store, source.clone(), 1000, options).run().await.unwrap();
        assert_eq!(report.resumed_from, None);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
