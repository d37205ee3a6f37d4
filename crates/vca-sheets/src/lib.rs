//! Spreadsheet-shaped master data: tabular model, column resolution, sources and the sheet catalog.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use vca_core::{
    collections, normalize_key, BuyOrBuildRow, CapabilityMasterRow, MasterSheet,
    MaturityMappingRow, ValidationError, ValueChainMasterRow,
};
use vca_storage::{
    from_document, sha256_hex, to_document, Document, DocumentStore, FetchError, Filter,
    HttpFetcher, StoreError, Update, ID_FIELD,
};

pub const CRATE_NAME: &str = "vca-sheets";

/// Field recording a row's position inside an imported sheet.
pub const ROW_FIELD: &str = "_row";

const HINT_THRESHOLD: f64 = 0.85;

/// Expected column absent from a sheet's header row.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[error("sheet `{sheet}` is missing required column(s): {}{}", missing.join(", "), render_hints(hints))]
#[serde(rename_all = "camelCase")]
pub struct SchemaMismatch {
    pub sheet: String,
    pub missing: Vec<String>,
    /// `"<missing> ~ <closest header>"` pairs for near-miss headers.
    pub hints: Vec<String>,
}

fn render_hints(hints: &[String]) -> String {
    if hints.is_empty() {
        String::new()
    } else {
        format!(" (closest headers: {})", hints.join(", "))
    }
}

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("invalid sheet payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Schema(#[from] SchemaMismatch),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing sheet json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Header row plus string cells, independent of where the sheet came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetTable {
    pub sheet_name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl SheetTable {
    pub fn empty(sheet_name: impl Into<String>) -> Self {
        Self {
            sheet_name: sheet_name.into(),
            headers: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// `true` when the sheet was never imported (no header row at all).
    pub fn has_no_header(&self) -> bool {
        self.headers.is_empty()
    }

    /// Build from a cell grid whose first row is the header.
    pub fn from_cells(sheet_name: impl Into<String>, grid: &[Vec<JsonValue>]) -> Self {
        let sheet_name = sheet_name.into();
        let Some((header_row, data)) = grid.split_first() else {
            return Self::empty(sheet_name);
        };
        let headers = header_row
            .iter()
            .enumerate()
            .map(|(idx, cell)| {
                let text = render_cell(cell);
                if text.trim().is_empty() {
                    format!("column_{}", idx + 1)
                } else {
                    text.trim().to_string()
                }
            })
            .collect::<Vec<_>>();
        let rows = data
            .iter()
            .map(|row| {
                (0..headers.len())
                    .map(|idx| row.get(idx).map(render_cell).unwrap_or_default())
                    .collect::<Vec<_>>()
            })
            .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
            .collect();
        Self {
            sheet_name,
            headers,
            rows,
        }
    }

    /// Build from row documents keyed by header name.
    ///
    /// `headers` fixes the column order; without it columns are collected from the documents.
    pub fn from_documents(
        sheet_name: impl Into<String>,
        headers: Option<Vec<String>>,
        docs: &[Document],
    ) -> Self {
        let headers = headers.unwrap_or_else(|| {
            let mut seen = HashSet::new();
            docs.iter()
                .flat_map(|doc| doc.keys())
                .filter(|k| k.as_str() != ID_FIELD && k.as_str() != ROW_FIELD)
                .filter(|k| seen.insert(k.to_string()))
                .cloned()
                .collect()
        });
        let mut ordered = docs.iter().collect::<Vec<_>>();
        ordered.sort_by_key(|doc| doc.get(ROW_FIELD).and_then(JsonValue::as_u64).unwrap_or(u64::MAX));
        let rows = ordered
            .into_iter()
            .map(|doc| {
                headers
                    .iter()
                    .map(|h| doc.get(h).map(render_cell).unwrap_or_default())
                    .collect::<Vec<_>>()
            })
            .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
            .collect();
        Self {
            sheet_name: sheet_name.into(),
            headers,
            rows,
        }
    }

    /// Parse any of the accepted payload shapes:
    /// `{"values": [[..]]}`, `{"data": ..}`, `[[..]]` or `[{header: value}]`.
    pub fn from_payload(sheet_name: impl Into<String>, payload: &JsonValue) -> Result<Self, SheetError> {
        let sheet_name = sheet_name.into();
        match payload {
            JsonValue::Object(map) => {
                if let Some(inner) = map.get("values").or_else(|| map.get("data")) {
                    Self::from_payload(sheet_name, inner)
                } else {
                    Err(SheetError::Payload(
                        "object payload needs a `values` or `data` array".to_string(),
                    ))
                }
            }
            JsonValue::Array(items) => match items.first() {
                None => Ok(Self::empty(sheet_name)),
                Some(JsonValue::Array(_)) => {
                    let grid = items
                        .iter()
                        .map(|row| match row {
                            JsonValue::Array(cells) => Ok(cells.clone()),
                            other => Err(SheetError::Payload(format!(
                                "expected every row to be an array, found {other}"
                            ))),
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Self::from_cells(sheet_name, &grid))
                }
                Some(JsonValue::Object(_)) => {
                    let docs = items
                        .iter()
                        .filter_map(|item| item.as_object().cloned())
                        .collect::<Vec<_>>();
                    Ok(Self::from_documents(sheet_name, None, &docs))
                }
                Some(other) => Err(SheetError::Payload(format!(
                    "rows must be arrays or objects, found {other}"
                ))),
            },
            other => Err(SheetError::Payload(format!("unsupported payload {other}"))),
        }
    }

    /// Row documents keyed by header, as served to clients.
    pub fn records(&self) -> Vec<Document> {
        self.rows
            .iter()
            .map(|row| {
                self.headers
                    .iter()
                    .zip(row)
                    .map(|(h, cell)| (h.clone(), JsonValue::String(cell.clone())))
                    .collect::<Document>()
            })
            .collect()
    }

    /// Row documents carrying their position, as persisted.
    pub fn to_documents(&self) -> Vec<Document> {
        self.records()
            .into_iter()
            .enumerate()
            .map(|(idx, mut doc)| {
                doc.insert(ROW_FIELD.to_string(), JsonValue::from(idx as u64));
                doc
            })
            .collect()
    }

    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(&(&self.headers, &self.rows)).unwrap_or_default();
        sha256_hex(&bytes)
    }

    /// Locate `specs` in the header row, failing with every missing required column.
    pub fn columns(&self, specs: &[ColumnSpec]) -> Result<ColumnIndex, SchemaMismatch> {
        let normalized = self.headers.iter().map(|h| normalize_key(h)).collect::<Vec<_>>();
        let mut positions = Vec::with_capacity(specs.len());
        let mut missing = Vec::new();
        let mut hints = Vec::new();

        for spec in specs {
            let position = spec.aliases.iter().find_map(|alias| {
                let alias = normalize_key(alias);
                normalized.iter().position(|h| *h == alias)
            });
            if position.is_none() && spec.required {
                missing.push(spec.label.to_string());
                if let Some(closest) = closest_header(spec, &self.headers) {
                    hints.push(format!("{} ~ {}", spec.label, closest));
                }
            }
            positions.push((spec.label, position));
        }

        if missing.is_empty() {
            Ok(ColumnIndex { positions })
        } else {
            Err(SchemaMismatch {
                sheet: self.sheet_name.clone(),
                missing,
                hints,
            })
        }
    }
}

fn closest_header(spec: &ColumnSpec, headers: &[String]) -> Option<String> {
    headers
        .iter()
        .map(|h| {
            let score = spec
                .aliases
                .iter()
                .map(|alias| jaro_winkler(&normalize_key(alias), &normalize_key(h)))
                .fold(0.0_f64, f64::max);
            (score, h)
        })
        .filter(|(score, _)| *score >= HINT_THRESHOLD)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, h)| h.clone())
}

pub fn render_cell(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// A logical column and the header spellings accepted for it.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub label: &'static str,
    pub aliases: &'static [&'static str],
    pub required: bool,
}

impl ColumnSpec {
    pub const fn required(label: &'static str, aliases: &'static [&'static str]) -> Self {
        Self {
            label,
            aliases,
            required: true,
        }
    }

    pub const fn optional(label: &'static str, aliases: &'static [&'static str]) -> Self {
        Self {
            label,
            aliases,
            required: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnIndex {
    positions: Vec<(&'static str, Option<usize>)>,
}

impl ColumnIndex {
    pub fn has(&self, label: &str) -> bool {
        self.position(label).is_some()
    }

    fn position(&self, label: &str) -> Option<usize> {
        self.positions
            .iter()
            .find(|(l, _)| *l == label)
            .and_then(|(_, p)| *p)
    }

    /// Trimmed cell for `label`; empty when the column or cell is absent.
    pub fn cell<'r>(&self, row: &'r [String], label: &str) -> &'r str {
        self.position(label)
            .and_then(|idx| row.get(idx))
            .map(|s| s.trim())
            .unwrap_or("")
    }

    pub fn number(&self, row: &[String], label: &str) -> Option<f64> {
        self.cell(row, label).parse().ok()
    }
}

pub mod columns {
    use super::ColumnSpec;

    pub const STAGE: &str = "Value Chain Stage";
    pub const INDUSTRY: &str = "Industry";
    pub const INDUSTRIES: &str = "Industries";
    pub const NAME: &str = "Name";
    pub const DESCRIPTION: &str = "Description";
    pub const SHORT_DESCRIPTION: &str = "Short Description";
    pub const CAPABILITY_NAME: &str = "Capability Name";
    pub const BUSINESS_LEVEL: &str = "Business Maturity Level";
    pub const TECHNOLOGY_LEVEL: &str = "Technology Maturity Level";
    pub const MATURITY_LEVEL: &str = "Maturity Level";
    pub const BUSINESS_NUMBER: &str = "Business Maturity Number";
    pub const TECHNOLOGY_NUMBER: &str = "Technology Maturity Number";
    pub const SUGGESTIONS: &str = "Suggestions";

    const STAGE_ALIASES: &[&str] = &["value chain stage", "stage", "value chain"];
    const DESCRIPTION_ALIASES: &[&str] = &["description", "descriptions"];
    const CAPABILITY_ALIASES: &[&str] = &["capability name", "capability", "capabilities"];
    const INDUSTRY_ALIASES: &[&str] = &["industry", "industries", "business type"];

    pub const VALUE_CHAIN_MASTER: &[ColumnSpec] = &[
        ColumnSpec::required(STAGE, STAGE_ALIASES),
        ColumnSpec::optional(INDUSTRY, INDUSTRY_ALIASES),
        ColumnSpec::optional(NAME, &["name", "value chain name"]),
        ColumnSpec::optional(DESCRIPTION, DESCRIPTION_ALIASES),
    ];

    pub const CAPABILITY_MASTER: &[ColumnSpec] = &[
        ColumnSpec::required(STAGE, STAGE_ALIASES),
        ColumnSpec::required(CAPABILITY_NAME, CAPABILITY_ALIASES),
        ColumnSpec::optional(DESCRIPTION, &["description", "capability description"]),
        ColumnSpec::optional(SHORT_DESCRIPTION, &["short description", "short desc"]),
        ColumnSpec::required(INDUSTRIES, &["industries", "industry"]),
    ];

    pub const MATURITY_MAPPING: &[ColumnSpec] = &[
        ColumnSpec::required(
            BUSINESS_LEVEL,
            &["business maturity level", "business maturity", "business level"],
        ),
        ColumnSpec::required(
            TECHNOLOGY_LEVEL,
            &[
                "technology maturity level",
                "technology maturity",
                "tech maturity level",
                "technology level",
            ],
        ),
        ColumnSpec::required(MATURITY_LEVEL, &["maturity level", "label", "maturity label", "maturity"]),
        ColumnSpec::optional(BUSINESS_NUMBER, &["business maturity number", "business number"]),
        ColumnSpec::optional(
            TECHNOLOGY_NUMBER,
            &["technology maturity number", "tech maturity number", "technology number"],
        ),
        ColumnSpec::optional(DESCRIPTION, DESCRIPTION_ALIASES),
    ];

    pub const BUY_OR_BUILD: &[ColumnSpec] = &[
        ColumnSpec::required(CAPABILITY_NAME, CAPABILITY_ALIASES),
        ColumnSpec::optional(INDUSTRY, INDUSTRY_ALIASES),
        ColumnSpec::optional(DESCRIPTION, DESCRIPTION_ALIASES),
        ColumnSpec::required(SUGGESTIONS, &["suggestions", "suggestion", "buy or build"]),
    ];
}

pub fn parse_value_chain_master(table: &SheetTable) -> Result<Vec<ValueChainMasterRow>, SchemaMismatch> {
    if table.has_no_header() {
        return Ok(Vec::new());
    }
    let idx = table.columns(columns::VALUE_CHAIN_MASTER)?;
    Ok(table
        .rows
        .iter()
        .filter(|row| !idx.cell(row, columns::STAGE).is_empty())
        .map(|row| {
            let stage = idx.cell(row, columns::STAGE).to_string();
            let name = idx.cell(row, columns::NAME);
            ValueChainMasterRow {
                industry: idx.cell(row, columns::INDUSTRY).to_string(),
                name: if name.is_empty() { stage.clone() } else { name.to_string() },
                value_chain_stage: stage,
                description: idx.cell(row, columns::DESCRIPTION).to_string(),
            }
        })
        .collect())
}

pub fn parse_capability_master(table: &SheetTable) -> Result<Vec<CapabilityMasterRow>, SchemaMismatch> {
    if table.has_no_header() {
        return Ok(Vec::new());
    }
    let idx = table.columns(columns::CAPABILITY_MASTER)?;
    Ok(table
        .rows
        .iter()
        .filter(|row| !idx.cell(row, columns::CAPABILITY_NAME).is_empty())
        .map(|row| {
            let short = idx.cell(row, columns::SHORT_DESCRIPTION);
            CapabilityMasterRow {
                value_chain_stage: idx.cell(row, columns::STAGE).to_string(),
                capability_name: idx.cell(row, columns::CAPABILITY_NAME).to_string(),
                description: idx.cell(row, columns::DESCRIPTION).to_string(),
                short_description: (!short.is_empty()).then(|| short.to_string()),
                industries: idx.cell(row, columns::INDUSTRIES).to_string(),
            }
        })
        .collect())
}

pub fn parse_maturity_mapping(table: &SheetTable) -> Result<Vec<MaturityMappingRow>, SchemaMismatch> {
    if table.has_no_header() {
        return Ok(Vec::new());
    }
    let idx = table.columns(columns::MATURITY_MAPPING)?;
    Ok(table
        .rows
        .iter()
        .map(|row| MaturityMappingRow {
            business_maturity_level: idx.cell(row, columns::BUSINESS_LEVEL).to_string(),
            technology_maturity_level: idx.cell(row, columns::TECHNOLOGY_LEVEL).to_string(),
            maturity_level: idx.cell(row, columns::MATURITY_LEVEL).to_string(),
            business_maturity_number: idx.number(row, columns::BUSINESS_NUMBER),
            technology_maturity_number: idx.number(row, columns::TECHNOLOGY_NUMBER),
            description: idx.cell(row, columns::DESCRIPTION).to_string(),
        })
        .collect())
}

pub fn parse_buy_or_build(table: &SheetTable) -> Result<Vec<BuyOrBuildRow>, SchemaMismatch> {
    if table.has_no_header() {
        return Ok(Vec::new());
    }
    let idx = table.columns(columns::BUY_OR_BUILD)?;
    Ok(table
        .rows
        .iter()
        .filter(|row| !idx.cell(row, columns::CAPABILITY_NAME).is_empty())
        .map(|row| BuyOrBuildRow {
            capability_name: idx.cell(row, columns::CAPABILITY_NAME).to_string(),
            industry: idx.cell(row, columns::INDUSTRY).to_string(),
            description: idx.cell(row, columns::DESCRIPTION).to_string(),
            suggestions: idx
                .cell(row, columns::SUGGESTIONS)
                .split(['\n', ';'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
        })
        .collect())
}

/// Anything that can produce a sheet table.
#[async_trait]
pub trait SheetSource: Send + Sync {
    fn sheet_name(&self) -> &str;
    async fn load(&self) -> Result<SheetTable, SheetError>;
}

#[derive(Debug, Clone)]
pub struct InlineSheet {
    pub sheet_name: String,
    pub payload: JsonValue,
}

#[async_trait]
impl SheetSource for InlineSheet {
    fn sheet_name(&self) -> &str {
        &self.sheet_name
    }

    async fn load(&self) -> Result<SheetTable, SheetError> {
        SheetTable::from_payload(&self.sheet_name, &self.payload)
    }
}

#[derive(Debug, Clone)]
pub struct FileSheet {
    pub sheet_name: String,
    pub path: PathBuf,
}

#[async_trait]
impl SheetSource for FileSheet {
    fn sheet_name(&self) -> &str {
        &self.sheet_name
    }

    async fn load(&self) -> Result<SheetTable, SheetError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SheetError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        let payload: JsonValue = serde_json::from_str(&text)?;
        SheetTable::from_payload(&self.sheet_name, &payload)
    }
}

#[derive(Debug, Clone)]
pub struct RemoteSheet {
    pub sheet_name: String,
    pub url: String,
    pub fetcher: Arc<HttpFetcher>,
}

#[async_trait]
impl SheetSource for RemoteSheet {
    fn sheet_name(&self) -> &str {
        &self.sheet_name
    }

    async fn load(&self) -> Result<SheetTable, SheetError> {
        let bytes = self.fetcher.fetch_bytes(&self.sheet_name, &self.url).await?;
        let payload: JsonValue = serde_json::from_slice(&bytes)?;
        SheetTable::from_payload(&self.sheet_name, &payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetSourceKind {
    File,
    Remote,
}

/// One entry of the sheet registry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetSourceConfig {
    pub sheet_name: String,
    pub kind: SheetSourceKind,
    pub location: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub fn source_for(
    config: &SheetSourceConfig,
    workspace_root: &Path,
    fetcher: Arc<HttpFetcher>,
) -> Box<dyn SheetSource> {
    match config.kind {
        SheetSourceKind::File => Box::new(FileSheet {
            sheet_name: config.sheet_name.clone(),
            path: workspace_root.join(&config.location),
        }),
        SheetSourceKind::Remote => Box::new(RemoteSheet {
            sheet_name: config.sheet_name.clone(),
            url: config.location.clone(),
            fetcher,
        }),
    }
}

/// Canonical spelling for known master sheets; other names pass through trimmed.
pub fn canonical_sheet_name(name: &str) -> String {
    MasterSheet::from_sheet_name(name)
        .map(|sheet| sheet.sheet_name().to_string())
        .unwrap_or_else(|| name.trim().to_string())
}

/// Sheet names double as legacy collection names, so they may not name an
/// application collection or a versioned sheet collection.
fn check_sheet_name(sheet_name: &str) -> Result<(), ValidationError> {
    if collections::is_reserved(sheet_name) || sheet_name.contains("::") {
        return Err(ValidationError {
            field: "sheetName".to_string(),
            message: format!("`{sheet_name}` is a reserved collection name"),
        });
    }
    Ok(())
}

/// Pointer from a sheet name to the versioned collection currently serving it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetAlias {
    pub sheet_name: String,
    pub sheet_key: String,
    pub collection: String,
    pub version: String,
    pub headers: Vec<String>,
    pub row_count: usize,
    pub content_hash: String,
    pub imported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub sheet_name: String,
    pub version: String,
    pub collection: String,
    pub row_count: usize,
    pub unchanged: bool,
}

/// Reads and atomically replaces master sheets in the document store.
///
/// Rows land in a fresh `"<sheet>::<version>"` collection; the swap is a single
/// upsert of the sheet's alias. The previous version is deleted afterwards, so a
/// failure at any step leaves either the old or the new data active, never neither.
#[derive(Clone)]
pub struct SheetCatalog {
    store: Arc<dyn DocumentStore>,
}

impl SheetCatalog {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub async fn alias(&self, sheet_name: &str) -> Result<Option<SheetAlias>, SheetError> {
        let key = normalize_key(&canonical_sheet_name(sheet_name));
        let doc = self
            .store
            .find_one(collections::SHEET_ALIASES, &Filter::new().eq("sheetKey", key))
            .await?;
        Ok(doc.map(from_document::<SheetAlias>).transpose()?)
    }

    pub async fn load(&self, sheet_name: &str) -> Result<SheetTable, SheetError> {
        let sheet_name = canonical_sheet_name(sheet_name);
        check_sheet_name(&sheet_name)?;
        if let Some(alias) = self.alias(&sheet_name).await? {
            let docs = self.store.find(&alias.collection, &Filter::new()).await?;
            return Ok(SheetTable::from_documents(sheet_name, Some(alias.headers), &docs));
        }
        // Sheets pushed before versioned imports live in a collection named after the sheet.
        let docs = self.store.find(&sheet_name, &Filter::new()).await?;
        Ok(SheetTable::from_documents(sheet_name, None, &docs))
    }

    pub async fn load_master(&self, sheet: MasterSheet) -> Result<SheetTable, SheetError> {
        self.load(sheet.sheet_name()).await
    }

    pub async fn replace(&self, table: &SheetTable) -> Result<ImportReport, SheetError> {
        let sheet_name = canonical_sheet_name(&table.sheet_name);
        if sheet_name.is_empty() {
            return Err(SheetError::Payload("sheetName is required".to_string()));
        }
        check_sheet_name(&sheet_name)?;
        if table.has_no_header() {
            return Err(SheetError::Payload(format!("sheet `{sheet_name}` has no header row")));
        }

        let span = info_span!("sheet_import", sheet = %sheet_name, rows = table.rows.len());
        self.swap_in(sheet_name, table).instrument(span).await
    }

    async fn swap_in(&self, sheet_name: String, table: &SheetTable) -> Result<ImportReport, SheetError> {
        let content_hash = table.content_hash();
        let current = self.alias(&sheet_name).await?;
        if let Some(alias) = current.as_ref().filter(|a| a.content_hash == content_hash) {
            info!(version = %alias.version, "sheet content unchanged; skipping import");
            return Ok(ImportReport {
                sheet_name: sheet_name.clone(),
                version: alias.version.clone(),
                collection: alias.collection.clone(),
                row_count: alias.row_count,
                unchanged: true,
            });
        }

        let imported_at = Utc::now();
        let version = format!("{}-{}", imported_at.format("%Y%m%d%H%M%S"), &content_hash[..12]);
        let collection = format!("{sheet_name}::{version}");
        self.store.insert_many(&collection, table.to_documents()).await?;

        let alias = SheetAlias {
            sheet_key: normalize_key(&sheet_name),
            sheet_name: sheet_name.clone(),
            collection: collection.clone(),
            version: version.clone(),
            headers: table.headers.clone(),
            row_count: table.rows.len(),
            content_hash,
            imported_at,
        };
        self.store
            .update_one(
                collections::SHEET_ALIASES,
                &Filter::new().eq("sheetKey", alias.sheet_key.clone()),
                Update::set(to_document(&alias)?),
                true,
            )
            .await?;
        info!(%version, "sheet alias switched");

        let stale = match current {
            Some(prev) => Some(prev.collection).filter(|prev| *prev != collection),
            // Only master sheets were ever pushed into a collection named after the sheet.
            None => MasterSheet::from_sheet_name(&sheet_name).map(|_| sheet_name.clone()),
        };
        if let Some(stale) = stale {
            if let Err(err) = self.store.delete_many(&stale, &Filter::new()).await {
                warn!(collection = %stale, error = %err, "failed to drop superseded sheet rows");
            }
        }

        Ok(ImportReport {
            sheet_name,
            version,
            collection,
            row_count: table.rows.len(),
            unchanged: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vca_storage::MemoryStore;

    fn capability_table(header: JsonValue, rows: JsonValue) -> SheetTable {
        let mut grid = vec![header];
        grid.extend(rows.as_array().cloned().unwrap_or_default());
        SheetTable::from_payload("Capability Master", &JsonValue::Array(grid)).unwrap()
    }

    #[test]
    fn cell_grid_payload_renders_numbers_and_drops_blank_rows() {
        let table = SheetTable::from_payload(
            "Maturity Mapping",
            &json!({"values": [
                ["Business Maturity Level", "Technology Maturity Level", "Maturity Level", "Business Maturity Number"],
                ["Managed", "Homegrown", "Developing", 2],
                ["", "", null],
                ["Optimized", "Best of breed"]
            ]}),
        )
        .unwrap();
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][3], "2");
        assert_eq!(table.rows[1], vec!["Optimized", "Best of breed", "", ""]);
    }

    #[test]
    fn object_rows_payload_collects_headers() {
        let table = SheetTable::from_payload(
            "Buy or Build",
            &json!([
                {"_id": "x", "Capability Name": "CRM", "Suggestions": "Buy; Extend"},
                {"Capability Name": "ERP", "Suggestions": "Build", "Industry": "Retail"}
            ]),
        )
        .unwrap();
        assert!(table.headers.contains(&"Industry".to_string()));
        assert!(!table.headers.contains(&"_id".to_string()));
        let rows = parse_buy_or_build(&table).unwrap();
        assert_eq!(rows[0].suggestions, vec!["Buy", "Extend"]);
        assert_eq!(rows[1].industry, "Retail");
    }

    #[test]
    fn headers_resolve_through_aliases_and_normalization() {
        let table = capability_table(
            json!(["STAGE", "Capability", "Industries ", "Description"]),
            json!([["Sourcing", "Supplier Risk Mgmt", "Retail, CPG", "Assess supplier risk. Then act."]]),
        );
        let rows = parse_capability_master(&table).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value_chain_stage, "Sourcing");
        assert_eq!(rows[0].industries, "Retail, CPG");
        assert_eq!(rows[0].short_description, None);
    }

    #[test]
    fn missing_columns_are_all_named_with_hints() {
        let table = capability_table(
            json!(["Value Chain Stage", "Capabilty Nam", "Description"]),
            json!([["Sourcing", "Supplier Risk Mgmt", "x"]]),
        );
        let err = parse_capability_master(&table).unwrap_err();
        assert_eq!(err.sheet, "Capability Master");
        assert_eq!(err.missing, vec!["Capability Name", "Industries"]);
        assert_eq!(err.hints, vec!["Capability Name ~ Capabilty Nam"]);
        assert!(err.to_string().contains("Capability Name, Industries"));
    }

    #[test]
    fn never_imported_sheet_parses_as_no_data() {
        let empty = SheetTable::empty("Capability Master");
        assert!(parse_capability_master(&empty).unwrap().is_empty());
        assert!(parse_maturity_mapping(&SheetTable::empty("Maturity Mapping")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_swaps_alias_and_drops_previous_version() {
        let store = MemoryStore::shared();
        let catalog = SheetCatalog::new(store.clone());

        let first = capability_table(
            json!(["Value Chain Stage", "Capability Name", "Industries"]),
            json!([["Sourcing", "Supplier Risk Mgmt", "Retail"]]),
        );
        let report = catalog.replace(&first).await.unwrap();
        assert!(!report.unchanged);
        assert_eq!(report.row_count, 1);

        let again = catalog.replace(&first).await.unwrap();
        assert!(again.unchanged);
        assert_eq!(again.collection, report.collection);

        let second = capability_table(
            json!(["Value Chain Stage", "Capability Name", "Industries"]),
            json!([
                ["Sourcing", "Supplier Risk Mgmt", "Retail"],
                ["Logistics", "Route Planning", "Retail"]
            ]),
        );
        let swapped = catalog.replace(&second).await.unwrap();
        assert_ne!(swapped.collection, report.collection);

        let loaded = catalog.load("capability master").await.unwrap();
        assert_eq!(loaded.rows.len(), 2);
        assert_eq!(loaded.rows[1][1], "Route Planning");
        assert!(store
            .find(&report.collection, &Filter::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn legacy_collection_is_read_until_first_versioned_import() {
        let store = MemoryStore::shared();
        let mut legacy = Document::new();
        legacy.insert("Value Chain Stage".into(), json!("Sourcing"));
        legacy.insert("Capability Name".into(), json!("Supplier Risk Mgmt"));
        legacy.insert("Industries".into(), json!("Retail"));
        store.insert_one("Capability Master", legacy).await.unwrap();

        let catalog = SheetCatalog::new(store.clone());
        let table = catalog.load_master(MasterSheet::CapabilityMaster).await.unwrap();
        assert_eq!(parse_capability_master(&table).unwrap().len(), 1);

        catalog
            .replace(&capability_table(
                json!(["Value Chain Stage", "Capability Name", "Industries"]),
                json!([["Logistics", "Route Planning", "Retail"]]),
            ))
            .await
            .unwrap();
        assert!(store
            .find("Capability Master", &Filter::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn application_collections_cannot_be_used_as_sheets() {
        let store = MemoryStore::shared();
        let mut assessed = Document::new();
        assessed.insert("name".into(), json!("Supplier Risk Mgmt"));
        store.insert_one(collections::CAPABILITIES, assessed).await.unwrap();

        let catalog = SheetCatalog::new(store.clone());
        catalog
            .replace(&capability_table(
                json!(["Value Chain Stage", "Capability Name", "Industries"]),
                json!([["Sourcing", "Supplier Risk Mgmt", "Retail"]]),
            ))
            .await
            .unwrap();

        for name in ["Capabilities", "sheet aliases", "ValueChainEntries", "Capability Master::v1"] {
            let table = SheetTable::from_payload(name, &json!([["name"], ["X"]])).unwrap();
            let err = catalog.replace(&table).await.unwrap_err();
            assert!(matches!(err, SheetError::Validation(ref v) if v.field == "sheetName"), "{name}: {err:?}");
            assert!(matches!(catalog.load(name).await.unwrap_err(), SheetError::Validation(_)));
        }

        assert_eq!(store.find(collections::CAPABILITIES, &Filter::new()).await.unwrap().len(), 1);
        let master = catalog.load_master(MasterSheet::CapabilityMaster).await.unwrap();
        assert_eq!(master.rows.len(), 1);
    }

    #[tokio::test]
    async fn first_import_of_other_sheets_leaves_same_named_collection() {
        let store = MemoryStore::shared();
        let mut row = Document::new();
        row.insert("note".into(), json!("kept"));
        store.insert_one("Regions", row).await.unwrap();

        let catalog = SheetCatalog::new(store.clone());
        let table = SheetTable::from_payload("Regions", &json!([["Region"], ["EMEA"]])).unwrap();
        catalog.replace(&table).await.unwrap();

        assert_eq!(store.find("Regions", &Filter::new()).await.unwrap().len(), 1);
        assert_eq!(catalog.load("Regions").await.unwrap().rows, vec![vec!["EMEA".to_string()]]);
    }

    #[tokio::test]
    async fn headerless_payloads_are_rejected() {
        let catalog = SheetCatalog::new(MemoryStore::shared());
        let err = catalog
            .replace(&SheetTable::empty("Capability Master"))
            .await
            .unwrap_err();
        assert!(matches!(err, SheetError::Payload(_)));
    }

    #[tokio::test]
    async fn file_source_reads_json_grid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vcm.json");
        std::fs::write(
            &path,
            r#"[["Value Chain Stage","Industry","Description"],["Sourcing","Retail","Buy stuff"]]"#,
        )
        .unwrap();
        let source = FileSheet {
            sheet_name: "Value Chain Master".into(),
            path,
        };
        let table = source.load().await.unwrap();
        let rows = parse_value_chain_master(&table).unwrap();
        assert_eq!(rows[0].name, "Sourcing");
        assert_eq!(rows[0].industry, "Retail");
    }
}
