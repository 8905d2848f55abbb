use clap::Parser;
use orgmeter_sync::config::{Cli, Command};
use orgmeter_sync::core::runner::{self, RunOptions};
use orgmeter_sync::core::{sync, RecordStore};
use orgmeter_sync::utils::{logger, validation::Validate};
use orgmeter_sync::{Exporter, ImportError, ImportRunner, LocalStorage, SqliteStore, SyncConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 載入 TOML 配置
    let config = match SyncConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load config file '{}': {}", cli.config, e);
            eprintln!("💡 Make sure the file exists and is valid TOML format");
            std::process::exit(1);
        }
    };

    // 初始化日誌
    logger::init_logger(cli.verbose, cli.log_format.unwrap_or_else(|| config.log_format()));
    tracing::info!("🚀 Starting orgmeter-sync");
    tracing::info!("📁 Loaded configuration from: {}", cli.config);

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(1);
    }

    if let Err(e) = execute(&cli, config).await {
        report_failure(&e);
    }

    Ok(())
}

async fn execute(cli: &Cli, config: SyncConfig) -> orgmeter_sync::Result<()> {
    match &cli.command {
        Command::Import {
            funder,
            entity,
            full,
            dry_run,
        } => {
            let options = RunOptions {
                funders: funder.clone(),
                entities: entity.clone(),
                full_refresh: *full,
                monitor: cli.monitor.unwrap_or_else(|| config.monitoring_enabled()),
            };

            display_config_summary(&config, &options, *dry_run);
            if *dry_run {
                tracing::info!("🔍 DRY RUN MODE - No actual processing will occur");
                return perform_dry_run(&config, &options);
            }

            if options.monitor {
                tracing::info!("🔍 System monitoring enabled");
            }

            let store = Arc::new(SqliteStore::open(&config.store.database_path)?);
            let summary = ImportRunner::new(config, store).run(&options).await?;

            for report in &summary.reports {
                println!(
                    "✅ {}/{}: {} fetched, {} inserted, {} updated, {} unchanged, {} rejected{}",
                    report.funder,
                    report.entity,
                    report.fetched,
                    report.inserted,
                    report.updated,
                    report.unchanged,
                    report.rejected,
                    if report.completed { "" } else { " (stopped at max_pages)" }
                );
            }
            for failure in &summary.failures {
                eprintln!("❌ {}/{}: {}", failure.funder, failure.entity, failure.error);
            }
            println!("📊 {}", summary.totals());

            if !summary.is_success() {
                std::process::exit(2);
            }
            Ok(())
        }

        Command::Status { funder } => {
            let store = SqliteStore::open(&config.store.database_path)?;
            let funders: Vec<&str> = match funder {
                Some(id) => vec![id.as_str()],
                None => config.funders.iter().map(|f| f.id.as_str()).collect(),
            };

            for id in funders {
                println!("📋 {}", id);
                for stats in store.entity_stats(id).await? {
                    let checkpoint = stats
                        .checkpoint
                        .map(|c| format!("{} at page {}", c.status.as_str(), c.last_page))
                        .unwrap_or_else(|| "never imported".to_string());
                    println!(
                        "  {:<12} {:>7} records, {:>7} pending sync, {}",
                        stats.entity.to_string(),
                        stats.total,
                        stats.pending_sync,
                        checkpoint
                    );
                }
            }
            Ok(())
        }

        Command::Pending {
            funder,
            entity,
            limit,
        } => {
            let store = SqliteStore::open(&config.store.database_path)?;
            let records = sync::pending(&store, funder, *entity, *limit).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }

        Command::MarkSynced {
            funder,
            entity,
            id,
            sync_id,
        } => {
            let store = SqliteStore::open(&config.store.database_path)?;
            sync::mark_synced(&store, funder, *entity, id, sync_id).await?;
            println!("✅ {}/{} {} marked as synced ({})", funder, entity, id, sync_id);
            Ok(())
        }

        Command::Export {
            funder,
            entity,
            output,
        } => {
            if config.funder(funder).is_none() {
                return Err(ImportError::ConfigError {
                    message: format!("unknown funder '{}'", funder),
                });
            }

            let store = SqliteStore::open(&config.store.database_path)?;
            let output_path = output.as_deref().unwrap_or_else(|| config.export_path());
            let storage = LocalStorage::new(output_path);
            let outcome = Exporter::new(store, storage).export(funder, entity).await?;

            println!("📦 Export saved to: {}/{}", output_path, outcome.path);
            for (collection, count) in &outcome.summary.collections {
                println!("  {}: {} records", collection, count);
            }
            Ok(())
        }
    }
}

fn report_failure(e: &ImportError) {
    // 記錄詳細錯誤信息
    tracing::error!(
        "❌ orgmeter-sync failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 Suggestion: {}", e.recovery_suggestion());

    std::process::exit(e.exit_code());
}

fn display_config_summary(config: &SyncConfig, options: &RunOptions, dry_run: bool) {
    println!("📋 Configuration Summary:");
    println!("  OrgMeter: {}", config.orgmeter.base_url);
    println!("  Store: {}", config.store.database_path);
    println!("  Funders: {}", config.funders.len());
    println!("  Page Size: {}", config.orgmeter.page_size);
    println!("  Batch Size: {}", config.store.batch_size);
    println!("  Conflict Policy: {:?}", config.store.conflict_policy);

    if let Some(max_pages) = config.orgmeter.max_pages {
        println!("  Max Pages: {}", max_pages);
    }
    if options.full_refresh {
        println!("  🔄 FULL REFRESH: checkpoints ignored");
    }
    if dry_run {
        println!("  🔍 DRY RUN MODE ENABLED");
    }

    println!();
}

fn perform_dry_run(config: &SyncConfig, options: &RunOptions) -> orgmeter_sync::Result<()> {
    println!("🔍 Dry Run Analysis:");
    println!();

    for (funder, entities) in runner::plan(config, options)? {
        println!("📡 {} ({})", funder.id, config.base_url_for(funder));
        if entities.is_empty() {
            println!("  (no entities selected)");
        }
        for entity in entities {
            let mapping = config
                .entity_config(entity)
                .field_mapping
                .map(|m| m.len())
                .unwrap_or(0);
            println!(
                "  {:<12} → /{} ({} field mapping(s))",
                entity.to_string(),
                config.entity_path(entity).trim_start_matches('/'),
                mapping
            );
        }
    }

    println!();
    println!("✅ Dry run completed - configuration looks good!");
    Ok(())
}
