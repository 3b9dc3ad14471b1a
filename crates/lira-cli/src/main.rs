use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use lira_ingest::sweep::maybe_build_scheduler;
use lira_ingest::{load_tenant_registry, EngineConfig, ReassignmentSweep, TenantRegistry};
use lira_store::pg::PgStore;
use lira_web::{serve_from_env, AppState};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "lira-cli")]
#[command(about = "Lead intake & routing engine command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web boundary (plus the cron sweep when enabled).
    Serve,
    /// Run one auto-reassignment pass across all registered tenants.
    Sweep,
    /// Apply database migrations.
    Migrate,
    /// Ingest a payload file through the regular pipeline.
    Ingest {
        #[arg(long)]
        company: Uuid,
        #[arg(long)]
        source: String,
        #[arg(long)]
        file: PathBuf,
    },
}

async fn tenants_or_default(config: &EngineConfig) -> TenantRegistry {
    match load_tenant_registry(&config.tenants_file).await {
        Ok(registry) => registry,
        Err(err) => {
            eprintln!(
                "tenant registry unavailable ({err:#}); continuing with per-tenant defaults"
            );
            TenantRegistry::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let store = Arc::new(PgStore::connect(&config.database_url).await?);
            let tenants = tenants_or_default(&config).await;
            let state = AppState::new(store.clone(), tenants.clone());
            let sweep = Arc::new(ReassignmentSweep::new(
                store,
                state.router.clone(),
                tenants,
                config.sweep_lease_minutes,
            ));
            if let Some(scheduler) = maybe_build_scheduler(&config, sweep).await? {
                let mut scheduler = scheduler;
                scheduler.start().await.context("starting sweep scheduler")?;
            }
            serve_from_env(state).await
        }
        Commands::Sweep => {
            let store = Arc::new(PgStore::connect(&config.database_url).await?);
            let tenants = tenants_or_default(&config).await;
            let state = AppState::new(store.clone(), tenants.clone());
            let sweep = ReassignmentSweep::new(
                store,
                state.router.clone(),
                tenants,
                config.sweep_lease_minutes,
            );
            for (company_id, report) in sweep.run_all(Utc::now()).await? {
                println!(
                    "sweep company={company_id} scanned={} reassigned={} conflicts={}",
                    report.scanned, report.reassigned, report.conflicts
                );
            }
            Ok(())
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.run_migrations().await?;
            println!("migrations applied");
            Ok(())
        }
        Commands::Ingest {
            company,
            source,
            file,
        } => {
            let payload: serde_json::Value = serde_json::from_str(
                &std::fs::read_to_string(&file)
                    .with_context(|| format!("reading {}", file.display()))?,
            )
            .with_context(|| format!("parsing {}", file.display()))?;

            let store = Arc::new(PgStore::connect(&config.database_url).await?);
            let tenants = tenants_or_default(&config).await;
            let state = AppState::new(store, tenants);
            let report = state.pipeline.ingest(company, &source, &payload).await?;
            println!(
                "ingest complete: processed={} created={} updated={} skipped={} errors={}",
                report.processed, report.created, report.updated, report.skipped, report.errors
            );
            Ok(())
        }
    }
}
