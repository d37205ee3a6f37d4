//! Runtime configuration, store bootstrap, scheduled master-sheet sync and
//! Parquet export of assessments.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;
use vca_core::{normalize_key, MasterSheet};
use vca_reconcile::AssessmentService;
use vca_sheets::{
    parse_buy_or_build, parse_capability_master, parse_maturity_mapping, parse_value_chain_master,
    source_for, ImportReport, SchemaMismatch, SheetCatalog, SheetError, SheetSource,
    SheetSourceConfig, SheetTable,
};
use vca_storage::{
    sha256_hex, DocumentStore, HttpClientConfig, HttpFetcher, MemoryStore, PgDocumentStore,
};

pub const CRATE_NAME: &str = "vca-sync";

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Unset means the process-local in-memory store.
    pub database_url: Option<String>,
    pub web_port: u16,
    pub sheets_file: PathBuf,
    pub scheduler_enabled: bool,
    pub sheet_sync_cron: String,
    pub user_agent: Option<String>,
    pub http_timeout_secs: u64,
    pub export_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            database_url: non_empty("DATABASE_URL"),
            web_port: non_empty("VCA_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            sheets_file: non_empty("VCA_SHEETS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sheets.yaml")),
            scheduler_enabled: non_empty("VCA_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sheet_sync_cron: non_empty("SHEET_SYNC_CRON").unwrap_or_else(|| "0 0 5 * * *".to_string()),
            user_agent: non_empty("VCA_USER_AGENT"),
            http_timeout_secs: non_empty("VCA_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            export_dir: non_empty("VCA_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./exports")),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            ..Default::default()
        }
    }
}

/// Postgres when `DATABASE_URL` is set (schema created on connect), otherwise in-memory.
pub async fn connect_store(config: &AppConfig) -> Result<Arc<dyn DocumentStore>> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = PgDocumentStore::connect(url).await?;
            store
                .ensure_schema()
                .await
                .context("creating document store schema")?;
            info!("using postgres document store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; documents are kept in memory only");
            Ok(MemoryStore::shared())
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SheetRegistry {
    #[serde(default)]
    pub sheets: Vec<SheetSourceConfig>,
}

pub async fn load_sheet_registry(path: &Path) -> Result<SheetRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Parses known master sheets so a malformed one never replaces live data.
pub fn validate_master_sheet(table: &SheetTable) -> Result<(), SchemaMismatch> {
    match MasterSheet::from_sheet_name(&table.sheet_name) {
        Some(MasterSheet::ValueChainMaster) => parse_value_chain_master(table).map(drop),
        Some(MasterSheet::CapabilityMaster) => parse_capability_master(table).map(drop),
        Some(MasterSheet::MaturityMapping | MasterSheet::CapabilityMaturityModel) => {
            parse_maturity_mapping(table).map(drop)
        }
        Some(MasterSheet::BuyOrBuild) => parse_buy_or_build(table).map(drop),
        None => Ok(()),
    }
}

pub async fn import_table(catalog: &SheetCatalog, table: &SheetTable) -> Result<ImportReport, SheetError> {
    validate_master_sheet(table)?;
    catalog.replace(table).await
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetSyncFailure {
    pub sheet_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sheets: usize,
    pub imported: Vec<ImportReport>,
    pub unchanged: usize,
    pub failures: Vec<SheetSyncFailure>,
}

/// Pulls every enabled sheet in the registry and swaps it into the catalog.
pub struct SheetSyncPipeline {
    config: AppConfig,
    catalog: SheetCatalog,
    http: Arc<HttpFetcher>,
}

impl SheetSyncPipeline {
    pub fn new(config: AppConfig, store: Arc<dyn DocumentStore>) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self {
            config,
            catalog: SheetCatalog::new(store),
            http: Arc::new(http),
        })
    }

    pub fn catalog(&self) -> &SheetCatalog {
        &self.catalog
    }

    /// A failing sheet is reported and skipped; its previous version stays active.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = load_sheet_registry(&self.config.sheets_file).await?;
        let root = self
            .config
            .sheets_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let enabled: Vec<_> = registry.sheets.into_iter().filter(|s| s.enabled).collect();

        let mut imported = Vec::new();
        let mut unchanged = 0usize;
        let mut failures = Vec::new();
        for sheet in &enabled {
            let source = source_for(sheet, &root, self.http.clone());
            match self.sync_sheet(source.as_ref()).await {
                Ok(report) if report.unchanged => unchanged += 1,
                Ok(report) => imported.push(report),
                Err(err) => {
                    warn!(sheet = %sheet.sheet_name, error = %err, "sheet sync failed; keeping previous version");
                    failures.push(SheetSyncFailure {
                        sheet_name: sheet.sheet_name.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            enabled_sheets: enabled.len(),
            imported,
            unchanged,
            failures,
        };
        info!(
            %run_id,
            imported = summary.imported.len(),
            unchanged = summary.unchanged,
            failures = summary.failures.len(),
            "sheet sync finished"
        );
        Ok(summary)
    }

    async fn sync_sheet(&self, source: &dyn SheetSource) -> Result<ImportReport, SheetError> {
        let table = source.load().await?;
        import_table(&self.catalog, &table).await
    }
}

/// Cron-driven sync, present only when the scheduler is enabled.
pub async fn build_scheduler(pipeline: Arc<SheetSyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sheet_sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            if let Err(err) = pipeline.run_once().await {
                error!(error = %err, "scheduled sheet sync failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub entry_id: String,
    pub entry_name: String,
    pub exported_at: DateTime<Utc>,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub manifest_path: PathBuf,
    pub manifest: ExportManifest,
}

struct AssessmentRow {
    value_chain: String,
    star_rating: Option<f64>,
    capability: String,
    business_maturity: Option<String>,
    technology_maturity: Option<String>,
    maturity_level: Option<String>,
    business_owner: Option<String>,
    tech_owner: Option<String>,
    updated_at: Option<String>,
}

/// Writes one Parquet file with every capability of an entry, plus a manifest.
pub async fn export_assessments(service: &AssessmentService, entry_id: &str, out_dir: &Path) -> Result<ExportOutcome> {
    let submission = service
        .project_submission(entry_id)
        .await
        .with_context(|| format!("loading assessments for entry {entry_id}"))?;

    let rows: Vec<AssessmentRow> = submission
        .value_chain
        .iter()
        .flat_map(|chain| {
            chain.capability.iter().map(move |cap| AssessmentRow {
                value_chain: chain.name.clone(),
                star_rating: chain.star_rating,
                capability: cap.name.clone(),
                business_maturity: cap.business_maturity.clone(),
                technology_maturity: cap.technology_maturity.clone(),
                maturity_level: cap.maturity_level.clone(),
                business_owner: cap.business_owner.clone(),
                tech_owner: cap.tech_owner.clone(),
                updated_at: cap.updated_at.map(|ts| ts.to_rfc3339()),
            })
        })
        .collect();

    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;
    let exported_at = Utc::now();
    let slug = match normalize_key(&submission.value_chain_entry_name).replace(' ', "-") {
        slug if slug.is_empty() => entry_id.to_string(),
        slug => slug,
    };
    let stem = format!("assessments-{slug}-{}", exported_at.format("%Y%m%d%H%M%S"));
    let parquet_path = out_dir.join(format!("{stem}.parquet"));
    write_assessments_parquet(&parquet_path, &submission.value_chain_entry_name, &submission.business_type, &rows)?;

    let manifest = ExportManifest {
        schema_version: 1,
        entry_id: entry_id.to_string(),
        entry_name: submission.value_chain_entry_name.clone(),
        exported_at,
        files: vec![manifest_entry("assessments", out_dir, &parquet_path, rows.len())?],
    };
    let manifest_path = out_dir.join(format!("{stem}.manifest.json"));
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    info!(%entry_id, rows = rows.len(), path = %parquet_path.display(), "assessments exported");

    Ok(ExportOutcome {
        manifest_path,
        manifest,
    })
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_assessments_parquet(path: &Path, entry_name: &str, business_type: &str, rows: &[AssessmentRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("entry_name", DataType::Utf8, false),
        ArrowField::new("business_type", DataType::Utf8, false),
        ArrowField::new("value_chain", DataType::Utf8, false),
        ArrowField::new("star_rating", DataType::Float64, true),
        ArrowField::new("capability", DataType::Utf8, false),
        ArrowField::new("business_maturity", DataType::Utf8, true),
        ArrowField::new("technology_maturity", DataType::Utf8, true),
        ArrowField::new("maturity_level", DataType::Utf8, true),
        ArrowField::new("business_owner", DataType::Utf8, true),
        ArrowField::new("tech_owner", DataType::Utf8, true),
        ArrowField::new("updated_at", DataType::Utf8, true),
    ]));

    fn text<F>(rows: &[AssessmentRow], f: F) -> StringArray
    where
        F: Fn(&AssessmentRow) -> Option<&str>,
    {
        StringArray::from(rows.iter().map(f).collect::<Vec<_>>())
    }

    let entry_names = StringArray::from(vec![Some(entry_name); rows.len()]);
    let business_types = StringArray::from(vec![Some(business_type); rows.len()]);
    let star_ratings = Float64Array::from(rows.iter().map(|r| r.star_rating).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(entry_names),
            Arc::new(business_types),
            Arc::new(text(rows, |r| Some(r.value_chain.as_str()))),
            Arc::new(star_ratings),
            Arc::new(text(rows, |r| Some(r.capability.as_str()))),
            Arc::new(text(rows, |r| r.business_maturity.as_deref())),
            Arc::new(text(rows, |r| r.technology_maturity.as_deref())),
            Arc::new(text(rows, |r| r.maturity_level.as_deref())),
            Arc::new(text(rows, |r| r.business_owner.as_deref())),
            Arc::new(text(rows, |r| r.tech_owner.as_deref())),
            Arc::new(text(rows, |r| r.updated_at.as_deref())),
        ],
    )
    .context("building assessments record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, out_dir: &Path, path: &Path, rows: usize) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(out_dir).unwrap_or(path).display().to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
        rows,
    })
}
