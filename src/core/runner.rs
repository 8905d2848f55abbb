use crate::adapters::orgmeter::{ClientSettings, OrgMeterClient};
use crate::config::toml_config::{FunderConfig, OnEntityFailure, SyncConfig};
use crate::core::etl::{EngineOptions, ImportEngine};
use crate::core::pipeline::{OrgMeterPipeline, PipelineSettings};
use crate::core::{EntityKind, ImportReport, RecordStore};
use crate::utils::error::{ErrorCategory, ImportError, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Narrows a run to some funders and entity kinds.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub funders: Vec<String>,
    pub entities: Vec<EntityKind>,
    pub full_refresh: bool,
    pub monitor: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityFailure {
    pub funder: String,
    pub entity: EntityKind,
    pub error: String,
    #[serde(skip)]
    pub category: ErrorCategory,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub reports: Vec<ImportReport>,
    pub failures: Vec<EntityFailure>,
    #[serde(skip)]
    pub duration: Duration,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Aggregate counters for logs and `--json` output.
    pub fn totals(&self) -> serde_json::Value {
        let sum = |f: fn(&ImportReport) -> usize| self.reports.iter().map(f).sum::<usize>();
        serde_json::json!({
            "imports": self.reports.len(),
            "failed": self.failures.len(),
            "fetched": sum(|r| r.fetched),
            "inserted": sum(|r| r.inserted),
            "updated": sum(|r| r.updated),
            "unchanged": sum(|r| r.unchanged),
            "rejected": sum(|r| r.rejected),
            "filtered": sum(|r| r.filtered),
            "duration_ms": self.duration.as_millis() as u64,
        })
    }
}

/// Funder × entity pairs the options select, in run order.
pub fn plan<'a>(
    config: &'a SyncConfig,
    options: &RunOptions,
) -> Result<Vec<(&'a FunderConfig, Vec<EntityKind>)>> {
    for id in &options.funders {
        if config.funder(id).is_none() {
            return Err(ImportError::ConfigError {
                message: format!("unknown funder '{}'", id),
            });
        }
    }

    Ok(config
        .funders
        .iter()
        .filter(|f| options.funders.is_empty() || options.funders.contains(&f.id))
        .map(|funder| {
            let entities = config
                .enabled_entities(funder)
                .into_iter()
                .filter(|e| options.entities.is_empty() || options.entities.contains(e))
                .collect();
            (funder, entities)
        })
        .collect())
}

/// Runs funders × entity kinds one after another.
pub struct ImportRunner<S: RecordStore> {
    config: SyncConfig,
    store: Arc<S>,
}

impl<S: RecordStore> ImportRunner<S> {
    pub fn new(config: SyncConfig, store: Arc<S>) -> Self {
        Self { config, store }
    }

    pub async fn run(&self, options: &RunOptions) -> Result<RunSummary> {
        let started = Instant::now();
        let selected = plan(&self.config, options)?;
        let mut summary = RunSummary::default();
        let engine_options = EngineOptions {
            page_delay: self.config.page_delay(),
            max_pages: self.config.orgmeter.max_pages,
            full_refresh: options.full_refresh,
        };

        let mut started_any = false;
        for (funder, entities) in selected {
            if entities.is_empty() {
                tracing::info!("⏭️ {}: no entities selected", funder.id);
                continue;
            }

            let client = Arc::new(OrgMeterClient::new(ClientSettings::for_funder(
                &self.config,
                funder,
            ))?);

            for entity in entities.iter().copied() {
                if started_any && !self.config.entity_delay().is_zero() {
                    tokio::time::sleep(self.config.entity_delay()).await;
                }
                started_any = true;

                let settings = PipelineSettings::new(
                    self.config.store.batch_size,
                    self.config.store.conflict_policy,
                    self.config.entity_config(entity),
                );
                let pipeline = OrgMeterPipeline::new(
                    funder.id.clone(),
                    entity,
                    Arc::clone(&self.store),
                    Arc::clone(&client),
                    settings,
                );
                let engine = ImportEngine::new_with_monitoring(
                    pipeline,
                    engine_options.clone(),
                    options.monitor,
                );

                match engine.run().await {
                    Ok(report) => summary.reports.push(report),
                    Err(e) => {
                        tracing::error!(
                            "❌ {}/{} failed: {} (Category: {:?}, Severity: {:?})",
                            funder.id,
                            entity,
                            e,
                            e.category(),
                            e.severity()
                        );
                        if self.config.on_entity_failure() == OnEntityFailure::Abort {
                            return Err(e);
                        }
                        summary.failures.push(EntityFailure {
                            funder: funder.id.clone(),
                            entity,
                            error: e.to_string(),
                            category: e.category(),
                        });
                    }
                }
            }
        }

        summary.duration = started.elapsed();
        tracing::info!("📊 Import summary: {}", summary.totals());
        Ok(summary)
    }
}
