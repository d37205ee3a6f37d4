use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vca_reconcile::AssessmentService;
use vca_sheets::{FileSheet, SheetSource};
use vca_storage::PgDocumentStore;
use vca_sync::{connect_store, export_assessments, import_table, AppConfig, SheetSyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "vca-cli")]
#[command(about = "Value Chain Assessment command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (the default)
    Serve,
    /// Create the document store schema
    Migrate,
    /// Import one master sheet from a JSON file
    Import {
        #[arg(long)]
        sheet: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Pull every enabled sheet from the registry once
    Sync,
    /// Write an entry's assessments to Parquet
    Export {
        #[arg(long)]
        entry: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Merge duplicate capabilities and backfill comparison keys
    Reconcile,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => vca_web::serve(config).await?,
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL is required for migrate");
            };
            let store = PgDocumentStore::connect(url).await?;
            store.ensure_schema().await.context("creating document store schema")?;
            println!("migrate complete");
        }
        Commands::Import { sheet, file } => {
            let store = connect_store(&config).await?;
            let service = AssessmentService::new(store);
            let table = FileSheet {
                sheet_name: sheet,
                path: file.clone(),
            }
            .load()
            .await
            .with_context(|| format!("loading {}", file.display()))?;
            let report = import_table(service.catalog(), &table).await?;
            println!(
                "import complete: sheet={} version={} rows={} unchanged={}",
                report.sheet_name, report.version, report.row_count, report.unchanged
            );
        }
        Commands::Sync => {
            let store = connect_store(&config).await?;
            let summary = SheetSyncPipeline::new(config, store)?.run_once().await?;
            println!(
                "sync complete: run_id={} sheets={} imported={} unchanged={} failures={}",
                summary.run_id,
                summary.enabled_sheets,
                summary.imported.len(),
                summary.unchanged,
                summary.failures.len()
            );
            for failure in &summary.failures {
                eprintln!("  {}: {}", failure.sheet_name, failure.error);
            }
        }
        Commands::Export { entry, out } => {
            let store = connect_store(&config).await?;
            let service = AssessmentService::new(store);
            let out_dir = out.unwrap_or_else(|| config.export_dir.clone());
            let outcome = export_assessments(&service, &entry, &out_dir).await?;
            info!(manifest = %outcome.manifest_path.display(), "export written");
            println!("{}", serde_json::to_string_pretty(&outcome.manifest)?);
        }
        Commands::Reconcile => {
            let store = connect_store(&config).await?;
            let report = AssessmentService::new(store).reconcile().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
