//! Reconciliation layer for VCA: resolves master sheets against assessments,
//! merges capability records under either identity shape, and maintains the
//! entry/value-chain hierarchy.
//!
//! Every write persists the full identity of a record together with its
//! normalized keys, so lookups by id and lookups by display names converge on
//! the same document.

pub mod maturity;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use vca_core::{
    collections, list_contains, normalize_key, BuyOrBuildRow, Capability, CapabilityIdentity,
    CapabilityMasterRow, CapabilityUpdate, EntryDetails, Initiative, MasterSheet, Submission,
    SubmissionValueChain, ValidationError, ValueChain, ValueChainEntry, ValueChainInput,
    ValueChainMasterRow,
};
use vca_sheets::{
    parse_buy_or_build, parse_capability_master, parse_value_chain_master, SchemaMismatch,
    SheetCatalog, SheetError,
};
use vca_storage::{
    document_id, from_document, to_document, Document, DocumentStore, Filter, StoreError, Update,
    ID_FIELD,
};

pub use maturity::{lookup_maturity_level, lookup_maturity_numbers, MaturityMapper};

pub const CRATE_NAME: &str = "vca-reconcile";

pub const NAME_KEY: &str = "nameKey";
pub const BUSINESS_TYPE_KEY: &str = "businessTypeKey";
pub const VALUE_CHAIN_NAME_KEY: &str = "valueChainNameKey";
pub const VALUE_CHAIN_ENTRY_NAME_KEY: &str = "valueChainEntryNameKey";
pub const INITIATIVE_NAME_KEY: &str = "initiativeNameKey";
const UPDATED_AT: &str = "updatedAt";
const TIMESTAMP: &str = "timestamp";

const ASSESSMENT_FIELDS: [&str; 5] = [
    "businessMaturity",
    "technologyMaturity",
    "maturityLevel",
    "businessOwner",
    "techOwner",
];

const SHORT_DESCRIPTION_CHARS: usize = 120;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatch),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Sheet(SheetError),
}

impl From<SheetError> for ReconcileError {
    fn from(err: SheetError) -> Self {
        match err {
            SheetError::Schema(mismatch) => ReconcileError::SchemaMismatch(mismatch),
            SheetError::Validation(invalid) => ReconcileError::Validation(invalid),
            SheetError::Store(store) => ReconcileError::Storage(store),
            other => ReconcileError::Sheet(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

fn now() -> JsonValue {
    json!(Utc::now())
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn string_field<'d>(doc: &'d Document, field: &str) -> Option<&'d str> {
    doc.get(field)
        .and_then(JsonValue::as_str)
        .filter(|v| !v.trim().is_empty())
}

fn insert_named(doc: &mut Document, field: &str, key_field: &str, value: &str) {
    doc.insert(field.to_string(), JsonValue::from(value.trim()));
    doc.insert(key_field.to_string(), JsonValue::from(normalize_key(value)));
}

// ---------------------------------------------------------------------------
// Master-sheet resolver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityOption {
    pub name: String,
    pub description: String,
    pub short_description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedCapabilities {
    pub frames: Vec<Frame>,
    pub capabilities_by_frame: BTreeMap<String, Vec<CapabilityOption>>,
}

/// First sentence of `description`, capped at 120 characters.
pub fn short_description(description: &str) -> String {
    let text = description.trim();
    let mut chars = text.char_indices().peekable();
    let mut end = text.len();
    while let Some((idx, c)) = chars.next() {
        if c == '\n' {
            end = idx;
            break;
        }
        if matches!(c, '.' | '!' | '?') && chars.peek().map_or(true, |(_, next)| next.is_whitespace()) {
            end = idx + c.len_utf8();
            break;
        }
    }
    let sentence = text[..end].trim_end();
    if sentence.chars().count() <= SHORT_DESCRIPTION_CHARS {
        sentence.to_string()
    } else {
        sentence
            .chars()
            .take(SHORT_DESCRIPTION_CHARS)
            .collect::<String>()
            .trim_end()
            .to_string()
    }
}

fn industry_matches(industries: &str, business_key: &str) -> bool {
    business_key.is_empty() || industries.trim().is_empty() || list_contains(industries, business_key)
}

/// Pure resolution over already-parsed master rows.
pub fn resolve_from_rows(
    chains: &[ValueChainMasterRow],
    capabilities: &[CapabilityMasterRow],
    value_chain_names: &[String],
    business_type: &str,
) -> ResolvedCapabilities {
    let business = normalize_key(business_type);
    let mut resolved = ResolvedCapabilities::default();
    let mut requested = HashSet::new();

    for raw in value_chain_names {
        let key = normalize_key(raw);
        if key.is_empty() || !requested.insert(key.clone()) {
            continue;
        }

        let chain_row = chains.iter().find(|row| {
            (normalize_key(&row.value_chain_stage) == key || normalize_key(&row.name) == key)
                && industry_matches(&row.industry, &business)
        });
        let stage_key = chain_row
            .map(|row| normalize_key(&row.value_chain_stage))
            .unwrap_or_else(|| key.clone());
        let on_stage = |row: &&CapabilityMasterRow| {
            let row_stage = normalize_key(&row.value_chain_stage);
            row_stage == key || row_stage == stage_key
        };

        let label = chain_row
            .map(|row| row.value_chain_stage.trim().to_string())
            .or_else(|| {
                capabilities
                    .iter()
                    .find(on_stage)
                    .map(|row| row.value_chain_stage.trim().to_string())
            })
            .unwrap_or_else(|| raw.trim().to_string());

        if !resolved.frames.iter().any(|frame| frame.name == label) {
            resolved.frames.push(Frame {
                name: label.clone(),
                description: chain_row.map(|row| row.description.clone()).unwrap_or_default(),
            });
        }
        let options = resolved.capabilities_by_frame.entry(label).or_default();
        for row in capabilities.iter().filter(on_stage) {
            if !list_contains(&row.industries, &business) {
                continue;
            }
            let name_key = normalize_key(&row.capability_name);
            if options.iter().any(|opt| normalize_key(&opt.name) == name_key) {
                continue;
            }
            options.push(CapabilityOption {
                name: row.capability_name.trim().to_string(),
                description: row.description.clone(),
                short_description: row
                    .short_description
                    .clone()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| short_description(&row.description)),
            });
        }
    }
    resolved
}

/// Reads the Value Chain Master and Capability Master through the sheet catalog.
#[derive(Clone)]
pub struct MasterSheetResolver {
    catalog: SheetCatalog,
}

impl MasterSheetResolver {
    pub fn new(catalog: SheetCatalog) -> Self {
        Self { catalog }
    }

    async fn chain_rows(&self) -> Result<Vec<ValueChainMasterRow>> {
        let table = self.catalog.load_master(MasterSheet::ValueChainMaster).await?;
        Ok(parse_value_chain_master(&table)?)
    }

    async fn capability_rows(&self) -> Result<Vec<CapabilityMasterRow>> {
        let table = self.catalog.load_master(MasterSheet::CapabilityMaster).await?;
        Ok(parse_capability_master(&table)?)
    }

    pub async fn resolve_capabilities(
        &self,
        value_chain_names: &[String],
        business_type: &str,
    ) -> Result<ResolvedCapabilities> {
        if business_type.trim().is_empty() {
            return Err(ValidationError::missing("businessType").into());
        }
        let chains = self.chain_rows().await?;
        let capabilities = self.capability_rows().await?;
        Ok(resolve_from_rows(&chains, &capabilities, value_chain_names, business_type))
    }

    /// Distinct stages the Value Chain Master lists for an industry.
    pub async fn value_chains_for(&self, business_type: &str) -> Result<Vec<Frame>> {
        let business = normalize_key(business_type);
        let mut seen = HashSet::new();
        Ok(self
            .chain_rows()
            .await?
            .into_iter()
            .filter(|row| industry_matches(&row.industry, &business))
            .filter(|row| seen.insert(normalize_key(&row.value_chain_stage)))
            .map(|row| Frame {
                name: row.value_chain_stage.trim().to_string(),
                description: row.description,
            })
            .collect())
    }

    pub async fn capability_names_for_stage(&self, stage: &str, business_type: &str) -> Result<Vec<String>> {
        let resolved = self
            .resolve_capabilities(&[stage.to_string()], business_type)
            .await?;
        Ok(resolved
            .capabilities_by_frame
            .into_values()
            .flatten()
            .map(|option| option.name)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Capability record merger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub id: String,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedReport {
    pub inserted: usize,
    pub existing: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub scanned: usize,
    pub backfilled: usize,
    pub merged_groups: usize,
    pub deleted: u64,
    pub skipped: usize,
    pub hierarchy_backfilled: usize,
}

/// Identity fields and keys every capability write persists.
fn identity_document(identity: &CapabilityIdentity) -> Document {
    let mut doc = Document::new();
    insert_named(&mut doc, "name", NAME_KEY, &identity.name);
    if let Some(id) = identity.value_chain_id() {
        doc.insert("valueChainId".to_string(), JsonValue::from(id));
    }
    if let Some(id) = present(&identity.value_chain_entry_id) {
        doc.insert("valueChainEntryId".to_string(), JsonValue::from(id));
    }
    if let Some(name) = present(&identity.value_chain_entry_name) {
        insert_named(&mut doc, "valueChainEntryName", VALUE_CHAIN_ENTRY_NAME_KEY, name);
    }
    if let Some(name) = present(&identity.value_chain_name) {
        insert_named(&mut doc, "valueChainName", VALUE_CHAIN_NAME_KEY, name);
    }
    doc
}

fn fill(slot: &mut Option<String>, value: &str) {
    if present(slot).is_none() && !value.trim().is_empty() {
        *slot = Some(value.to_string());
    }
}

/// Chain-owned fields always come from the stored chain so display names do not
/// drift with the casing of whichever caller wrote last.
fn fill_from_chain(identity: &mut CapabilityIdentity, chain: &ValueChain) {
    fill(&mut identity.value_chain_id, &chain.id);
    fill(&mut identity.value_chain_entry_id, &chain.value_chain_entry_id);
    if !chain.value_chain_entry_name.trim().is_empty() {
        identity.value_chain_entry_name = Some(chain.value_chain_entry_name.trim().to_string());
    }
    if !chain.name.trim().is_empty() {
        identity.value_chain_name = Some(chain.name.trim().to_string());
    }
}

fn identity_of(capability: &Capability) -> CapabilityIdentity {
    CapabilityIdentity {
        value_chain_id: capability.value_chain_id.clone(),
        value_chain_entry_id: capability.value_chain_entry_id.clone(),
        value_chain_entry_name: capability.value_chain_entry_name.clone(),
        value_chain_name: capability.value_chain_name.clone(),
        name: capability.name.clone(),
    }
}

fn not_found(identity: &CapabilityIdentity) -> ReconcileError {
    ReconcileError::NotFound(format!("capability `{}`", identity.name.trim()))
}

/// Capability records addressed by either identity shape.
#[derive(Clone)]
pub struct CapabilityRepository {
    store: Arc<dyn DocumentStore>,
}

impl CapabilityRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Fills whichever identity side is missing from the owning value chain.
    pub async fn complete_identity(&self, identity: &CapabilityIdentity) -> Result<CapabilityIdentity> {
        identity.validate()?;
        let mut completed = identity.clone();
        let chain = match (identity.value_chain_id(), identity.display_names()) {
            (Some(id), _) => self.store.find_one(collections::VALUE_CHAINS, &Filter::by_id(id)).await?,
            (None, Some((entry, chain))) => {
                let filter = Filter::new()
                    .eq(VALUE_CHAIN_ENTRY_NAME_KEY, normalize_key(entry))
                    .eq(NAME_KEY, normalize_key(chain));
                self.store.find_one(collections::VALUE_CHAINS, &filter).await?
            }
            (None, None) => None,
        };
        if let Some(doc) = chain {
            fill_from_chain(&mut completed, &from_document::<ValueChain>(doc)?);
        }
        Ok(completed)
    }

    async fn find_document(&self, identity: &CapabilityIdentity) -> Result<Option<Document>> {
        let name_key = normalize_key(&identity.name);
        let chain_id = identity.value_chain_id();
        if let Some(id) = chain_id {
            let filter = Filter::new().eq("valueChainId", id).eq(NAME_KEY, name_key.clone());
            if let Some(doc) = self.store.find_one(collections::CAPABILITIES, &filter).await? {
                return Ok(Some(doc));
            }
        }
        let Some((entry, chain)) = identity.display_names() else {
            return Ok(None);
        };
        let filter = Filter::new()
            .eq(VALUE_CHAIN_ENTRY_NAME_KEY, normalize_key(entry))
            .eq(VALUE_CHAIN_NAME_KEY, normalize_key(chain))
            .eq(NAME_KEY, name_key);
        let candidates = self.store.find(collections::CAPABILITIES, &filter).await?;
        // A record already bound to another value chain belongs to a different entry.
        Ok(candidates.into_iter().find(|doc| {
            match (chain_id, string_field(doc, "valueChainId")) {
                (Some(wanted), Some(bound)) => wanted == bound,
                _ => true,
            }
        }))
    }

    /// Canonical lookup: id path first, display-name path as fallback.
    pub async fn find(&self, identity: &CapabilityIdentity) -> Result<Option<Capability>> {
        identity.validate()?;
        Ok(self
            .find_document(identity)
            .await?
            .map(from_document::<Capability>)
            .transpose()?)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Capability>> {
        let doc = self
            .store
            .find_one(collections::CAPABILITIES, &Filter::by_id(id))
            .await?;
        Ok(doc.map(from_document::<Capability>).transpose()?)
    }

    /// Field-level upsert of the supplied assessment fields.
    pub async fn merge(&self, update: &CapabilityUpdate) -> Result<MergeOutcome> {
        let span = info_span!("capability_merge", capability = %update.identity.name, upsert = true);
        self.write(update, true)
            .instrument(span)
            .await?
            .ok_or_else(|| not_found(&update.identity))
    }

    /// Like [`merge`](Self::merge) but never creates a record.
    pub async fn update_existing(&self, update: &CapabilityUpdate) -> Result<MergeOutcome> {
        let span = info_span!("capability_merge", capability = %update.identity.name, upsert = false);
        self.write(update, false)
            .instrument(span)
            .await?
            .ok_or_else(|| not_found(&update.identity))
    }

    async fn write(&self, update: &CapabilityUpdate, create_missing: bool) -> Result<Option<MergeOutcome>> {
        let identity = self.complete_identity(&update.identity).await?;
        let existing = self.find_document(&identity).await?;

        let mut set = identity_document(&identity);
        // The lookup matched on the name key, so the stored spelling wins.
        if let Some(stored) = existing.as_ref().and_then(|doc| string_field(doc, "name")) {
            set.insert("name".to_string(), JsonValue::from(stored));
        }
        for (field, value) in update.assessment_fields() {
            set.insert(field.to_string(), JsonValue::from(value));
        }
        set.insert(UPDATED_AT.to_string(), now());

        let existing_id = existing.as_ref().and_then(document_id).map(str::to_string);
        match existing_id {
            Some(id) => {
                self.store
                    .update_one(collections::CAPABILITIES, &Filter::by_id(&id), Update::set(set), false)
                    .await?;
                debug!(%id, "capability updated");
                Ok(Some(MergeOutcome { id, created: false }))
            }
            None if create_missing => {
                let id = self.store.insert_one(collections::CAPABILITIES, set).await?;
                info!(%id, "capability created");
                Ok(Some(MergeOutcome { id, created: true }))
            }
            None => Ok(None),
        }
    }

    /// Insert-if-absent for each name; existing records are left untouched.
    pub async fn seed(&self, value_chain: &ValueChain, names: &[String]) -> Result<SeedReport> {
        let mut report = SeedReport::default();
        let mut seen = HashSet::new();
        for name in names {
            let key = normalize_key(name);
            if key.is_empty() || !seen.insert(key.clone()) {
                continue;
            }
            let mut identity = CapabilityIdentity::by_id(value_chain.id.clone(), name.trim());
            fill_from_chain(&mut identity, value_chain);
            if self.find_document(&identity).await?.is_some() {
                report.existing += 1;
                continue;
            }
            let filter = Filter::new()
                .eq("valueChainId", value_chain.id.clone())
                .eq(NAME_KEY, key);
            let update = Update::default().with_set_on_insert(identity_document(&identity));
            let outcome = self
                .store
                .update_one(collections::CAPABILITIES, &filter, update, true)
                .await?;
            if outcome.upserted {
                report.inserted += 1;
            } else {
                report.existing += 1;
            }
        }
        debug!(value_chain = %value_chain.name, inserted = report.inserted, existing = report.existing, "capabilities seeded");
        Ok(report)
    }

    /// Capabilities of a value chain, including name-only records not yet bound to its id.
    pub async fn list_for_value_chain(&self, value_chain_id: &str) -> Result<Vec<Capability>> {
        let mut docs = self
            .store
            .find(collections::CAPABILITIES, &Filter::new().eq("valueChainId", value_chain_id))
            .await?;
        let chain = self
            .store
            .find_one(collections::VALUE_CHAINS, &Filter::by_id(value_chain_id))
            .await?;
        if let Some(chain) = chain {
            let chain: ValueChain = from_document(chain)?;
            let filter = Filter::new()
                .eq(VALUE_CHAIN_ENTRY_NAME_KEY, normalize_key(&chain.value_chain_entry_name))
                .eq(VALUE_CHAIN_NAME_KEY, normalize_key(&chain.name));
            let unbound = self.store.find(collections::CAPABILITIES, &filter).await?;
            docs.extend(
                unbound
                    .into_iter()
                    .filter(|doc| string_field(doc, "valueChainId").is_none()),
            );
        }
        docs.into_iter()
            .map(|doc| Ok(from_document::<Capability>(doc)?))
            .collect()
    }

    pub async fn list_for_entry(&self, entry_name: &str) -> Result<Vec<Capability>> {
        let filter = Filter::new().eq(VALUE_CHAIN_ENTRY_NAME_KEY, normalize_key(entry_name));
        self.store
            .find(collections::CAPABILITIES, &filter)
            .await?
            .into_iter()
            .map(|doc| Ok(from_document::<Capability>(doc)?))
            .collect()
    }

    /// One pass over every capability: backfill identity and keys, then collapse
    /// records that resolve to the same compound key onto the most recently updated one.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let mut chains = Vec::new();
        for doc in self.store.find(collections::VALUE_CHAINS, &Filter::new()).await? {
            match from_document::<ValueChain>(doc) {
                Ok(chain) => chains.push(chain),
                Err(err) => warn!(error = %err, "skipping unreadable value chain"),
            }
        }
        let by_id: HashMap<&str, &ValueChain> = chains.iter().map(|c| (c.id.as_str(), c)).collect();
        let mut by_names: HashMap<(String, String), &ValueChain> = HashMap::new();
        for chain in &chains {
            by_names
                .entry((normalize_key(&chain.value_chain_entry_name), normalize_key(&chain.name)))
                .or_insert(chain);
        }

        struct Member {
            id: String,
            doc: Document,
            identity: CapabilityIdentity,
            updated_at: Option<DateTime<Utc>>,
        }

        let mut groups: BTreeMap<String, Vec<Member>> = BTreeMap::new();
        for doc in self.store.find(collections::CAPABILITIES, &Filter::new()).await? {
            report.scanned += 1;
            let Some(id) = document_id(&doc).map(str::to_string) else {
                report.skipped += 1;
                continue;
            };
            let capability = match from_document::<Capability>(doc.clone()) {
                Ok(capability) => capability,
                Err(err) => {
                    warn!(%id, error = %err, "skipping unreadable capability");
                    report.skipped += 1;
                    continue;
                }
            };
            let mut identity = identity_of(&capability);
            let chain = identity
                .value_chain_id()
                .and_then(|chain_id| by_id.get(chain_id))
                .or_else(|| {
                    identity.display_names().and_then(|(entry, chain)| {
                        by_names.get(&(normalize_key(entry), normalize_key(chain)))
                    })
                });
            if let Some(chain) = chain {
                fill_from_chain(&mut identity, chain);
            }

            let name_key = normalize_key(&identity.name);
            let group = match (identity.value_chain_id(), identity.display_names()) {
                (Some(chain_id), _) => format!("id:{chain_id}|{name_key}"),
                (None, Some((entry, chain))) => {
                    format!("names:{}|{}|{name_key}", normalize_key(entry), normalize_key(chain))
                }
                (None, None) => format!("orphan:{id}"),
            };
            groups.entry(group).or_default().push(Member {
                id,
                doc,
                identity,
                updated_at: capability.updated_at,
            });
        }

        for (group, mut members) in groups {
            // Stable sort keeps insertion order among equal timestamps.
            members.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            let Some((survivor, rest)) = members.split_first() else {
                continue;
            };

            let mut set = identity_document(&survivor.identity);
            for field in ASSESSMENT_FIELDS {
                let has_value = |doc: &Document| doc.get(field).is_some_and(|v| !v.is_null());
                if has_value(&survivor.doc) {
                    continue;
                }
                if let Some(value) = rest.iter().find(|m| has_value(&m.doc)).and_then(|m| m.doc.get(field)) {
                    set.insert(field.to_string(), value.clone());
                }
            }
            set.retain(|field, value| survivor.doc.get(field.as_str()) != Some(&*value));

            if !set.is_empty() {
                self.store
                    .update_one(collections::CAPABILITIES, &Filter::by_id(&survivor.id), Update::set(set), false)
                    .await?;
                report.backfilled += 1;
            }
            if !rest.is_empty() {
                report.merged_groups += 1;
                for member in rest {
                    report.deleted += self
                        .store
                        .delete_many(collections::CAPABILITIES, &Filter::by_id(&member.id))
                        .await?;
                }
                info!(%group, survivor = %survivor.id, removed = rest.len(), "merged duplicate capabilities");
            }
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Entry / value-chain hierarchy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertCounts {
    pub inserted_count: usize,
    pub updated_count: usize,
}

/// Writes entries and their value chains keyed by normalized names.
#[derive(Clone)]
pub struct HierarchyBuilder {
    store: Arc<dyn DocumentStore>,
}

impl HierarchyBuilder {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Returns the same id for repeated calls with the same (name, business type).
    pub async fn upsert_value_chain_entry(
        &self,
        name: &str,
        business_type: &str,
        label: &str,
        details: &EntryDetails,
    ) -> Result<String> {
        if name.trim().is_empty() {
            return Err(ValidationError::missing("name").into());
        }
        if business_type.trim().is_empty() {
            return Err(ValidationError::missing("businessType").into());
        }

        let filter = Filter::new()
            .eq(NAME_KEY, normalize_key(name))
            .eq(BUSINESS_TYPE_KEY, normalize_key(business_type));
        let mut set = Document::new();
        set.insert("name".to_string(), JsonValue::from(name.trim()));
        set.insert("businessType".to_string(), JsonValue::from(business_type.trim()));
        if !label.trim().is_empty() {
            set.insert("label".to_string(), JsonValue::from(label.trim()));
        }
        if let Some(value) = details.business_complexity.clone().filter(|v| !v.is_null()) {
            set.insert("businessComplexity".to_string(), value);
        }
        if let Some(value) = details.annual_revenues.clone().filter(|v| !v.is_null()) {
            set.insert("annualRevenues".to_string(), value);
        }
        set.insert(TIMESTAMP.to_string(), now());

        let outcome = self
            .store
            .update_one(collections::VALUE_CHAIN_ENTRIES, &filter, Update::set(set), true)
            .await?;
        match outcome.document_id {
            Some(id) => Ok(id),
            None => self
                .store
                .find_one(collections::VALUE_CHAIN_ENTRIES, &filter)
                .await?
                .as_ref()
                .and_then(document_id)
                .map(str::to_string)
                .ok_or_else(|| ReconcileError::NotFound(format!("value chain entry `{}`", name.trim()))),
        }
    }

    pub async fn upsert_value_chains(
        &self,
        entry_id: &str,
        entry_name: &str,
        chains: &[ValueChainInput],
    ) -> Result<UpsertCounts> {
        if entry_id.trim().is_empty() {
            return Err(ValidationError::missing("valueChainEntryId").into());
        }
        if let Some(idx) = chains.iter().position(|c| c.name.trim().is_empty()) {
            return Err(ValidationError::missing(&format!("valueChains[{idx}].name")).into());
        }

        let entry_name = if entry_name.trim().is_empty() {
            self.entry_by_id(entry_id)
                .await?
                .map(|entry| entry.name)
                .ok_or_else(|| ReconcileError::NotFound(format!("value chain entry `{entry_id}`")))?
        } else {
            entry_name.trim().to_string()
        };

        let mut counts = UpsertCounts::default();
        for chain in chains {
            let filter = Filter::new()
                .eq("valueChainEntryId", entry_id)
                .eq(NAME_KEY, normalize_key(&chain.name));
            let mut set = Document::new();
            set.insert("valueChainEntryId".to_string(), JsonValue::from(entry_id));
            insert_named(&mut set, "valueChainEntryName", VALUE_CHAIN_ENTRY_NAME_KEY, &entry_name);
            insert_named(&mut set, "name", NAME_KEY, &chain.name);
            if let Some(rating) = chain.star_rating {
                set.insert("starRating".to_string(), json!(rating));
            }
            set.insert(TIMESTAMP.to_string(), now());

            if let Some(capability) = &chain.capability {
                set.insert("Capability".to_string(), JsonValue::Array(capability.clone()));
            }
            let mut update = Update::set(set);
            if chain.capability.is_none() {
                let mut on_insert = Document::new();
                on_insert.insert("Capability".to_string(), JsonValue::Array(Vec::new()));
                update = update.with_set_on_insert(on_insert);
            }

            let outcome = self
                .store
                .update_one(collections::VALUE_CHAINS, &filter, update, true)
                .await?;
            if outcome.upserted {
                counts.inserted_count += 1;
            } else if outcome.matched {
                counts.updated_count += 1;
            }
        }
        info!(%entry_id, inserted = counts.inserted_count, updated = counts.updated_count, "value chains upserted");
        Ok(counts)
    }

    pub async fn entry_by_id(&self, entry_id: &str) -> Result<Option<ValueChainEntry>> {
        let doc = self
            .store
            .find_one(collections::VALUE_CHAIN_ENTRIES, &Filter::by_id(entry_id))
            .await?;
        Ok(doc.map(from_document::<ValueChainEntry>).transpose()?)
    }

    pub async fn entries(&self) -> Result<Vec<ValueChainEntry>> {
        self.store
            .find(collections::VALUE_CHAIN_ENTRIES, &Filter::new())
            .await?
            .into_iter()
            .map(|doc| Ok(from_document::<ValueChainEntry>(doc)?))
            .collect()
    }

    pub async fn value_chain(&self, value_chain_id: &str) -> Result<Option<ValueChain>> {
        let doc = self
            .store
            .find_one(collections::VALUE_CHAINS, &Filter::by_id(value_chain_id))
            .await?;
        Ok(doc.map(from_document::<ValueChain>).transpose()?)
    }

    pub async fn value_chains_for_entry(&self, entry_id: &str) -> Result<Vec<ValueChain>> {
        self.store
            .find(collections::VALUE_CHAINS, &Filter::new().eq("valueChainEntryId", entry_id))
            .await?
            .into_iter()
            .map(|doc| Ok(from_document::<ValueChain>(doc)?))
            .collect()
    }

    /// Adds missing normalized keys to entries and value chains written before they existed.
    pub async fn backfill_keys(&self) -> Result<usize> {
        let mut updated = 0;
        let entries = self.store.find(collections::VALUE_CHAIN_ENTRIES, &Filter::new()).await?;
        for doc in &entries {
            let mut set = Document::new();
            expect_key(doc, "name", NAME_KEY, &mut set);
            expect_key(doc, "businessType", BUSINESS_TYPE_KEY, &mut set);
            updated += self.apply_backfill(collections::VALUE_CHAIN_ENTRIES, doc, set).await?;
        }

        let entry_names: HashMap<&str, &str> = entries
            .iter()
            .filter_map(|doc| Some((document_id(doc)?, string_field(doc, "name")?)))
            .collect();
        for doc in self.store.find(collections::VALUE_CHAINS, &Filter::new()).await? {
            let mut set = Document::new();
            expect_key(&doc, "name", NAME_KEY, &mut set);
            match string_field(&doc, "valueChainEntryName") {
                Some(_) => expect_key(&doc, "valueChainEntryName", VALUE_CHAIN_ENTRY_NAME_KEY, &mut set),
                None => {
                    let owner = string_field(&doc, "valueChainEntryId").and_then(|id| entry_names.get(id));
                    if let Some(name) = owner {
                        insert_named(&mut set, "valueChainEntryName", VALUE_CHAIN_ENTRY_NAME_KEY, name);
                    }
                }
            }
            if !doc.get("Capability").is_some_and(JsonValue::is_array) {
                set.insert("Capability".to_string(), JsonValue::Array(Vec::new()));
            }
            updated += self.apply_backfill(collections::VALUE_CHAINS, &doc, set).await?;
        }
        Ok(updated)
    }

    async fn apply_backfill(&self, collection: &str, doc: &Document, set: Document) -> Result<usize> {
        let Some(id) = document_id(doc) else {
            return Ok(0);
        };
        if set.is_empty() {
            return Ok(0);
        }
        self.store
            .update_one(collection, &Filter::by_id(id), Update::set(set), false)
            .await?;
        Ok(1)
    }
}

fn expect_key(doc: &Document, source: &str, key_field: &str, set: &mut Document) {
    let expected = normalize_key(string_field(doc, source).unwrap_or_default());
    if doc.get(key_field).and_then(JsonValue::as_str) != Some(expected.as_str()) {
        set.insert(key_field.to_string(), JsonValue::from(expected));
    }
}

// ---------------------------------------------------------------------------
// Initiatives and buy-or-build
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct InitiativeRepository {
    store: Arc<dyn DocumentStore>,
}

impl InitiativeRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Keyed by (initiative name, entry name); selected suggestions are replaced wholesale.
    pub async fn upsert_initiative(&self, initiative: &Initiative) -> Result<String> {
        initiative.validate()?;
        let filter = Filter::new()
            .eq(INITIATIVE_NAME_KEY, normalize_key(&initiative.initiative_name))
            .eq(VALUE_CHAIN_ENTRY_NAME_KEY, normalize_key(&initiative.value_chain_entry_name));
        let mut set = to_document(initiative)?;
        set.remove(ID_FIELD);
        set.insert(TIMESTAMP.to_string(), now());

        let outcome = self
            .store
            .update_one(collections::INITIATIVES, &filter, Update::set(set), true)
            .await?;
        outcome.document_id.ok_or_else(|| {
            ReconcileError::NotFound(format!("initiative `{}`", initiative.initiative_name.trim()))
        })
    }

    pub async fn initiatives_for(&self, entry_name: &str) -> Result<Vec<Initiative>> {
        let filter = Filter::new().eq(VALUE_CHAIN_ENTRY_NAME_KEY, normalize_key(entry_name));
        self.store
            .find(collections::INITIATIVES, &filter)
            .await?
            .into_iter()
            .map(|doc| Ok(from_document::<Initiative>(doc)?))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyOrBuildSuggestion {
    pub capability_name: String,
    pub description: String,
    pub suggestions: Vec<String>,
}

/// One suggestion group per requested capability that has matching rows.
pub fn match_suggestions(rows: &[BuyOrBuildRow], capability_names: &[String], industry: &str) -> Vec<BuyOrBuildSuggestion> {
    let industry = normalize_key(industry);
    let mut out: Vec<BuyOrBuildSuggestion> = Vec::new();
    for name in capability_names {
        let key = normalize_key(name);
        if key.is_empty() || out.iter().any(|s| normalize_key(&s.capability_name) == key) {
            continue;
        }
        let mut group: Option<BuyOrBuildSuggestion> = None;
        for row in rows.iter().filter(|row| {
            normalize_key(&row.capability_name) == key && industry_matches(&row.industry, &industry)
        }) {
            let entry = group.get_or_insert_with(|| BuyOrBuildSuggestion {
                capability_name: row.capability_name.trim().to_string(),
                description: row.description.clone(),
                suggestions: Vec::new(),
            });
            for suggestion in &row.suggestions {
                if !entry.suggestions.contains(suggestion) {
                    entry.suggestions.push(suggestion.clone());
                }
            }
        }
        out.extend(group);
    }
    out
}

// ---------------------------------------------------------------------------
// Service facade
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaturityLookup {
    pub maturity_level: String,
    pub business_number: Option<f64>,
    pub technology_number: Option<f64>,
}

/// Entry point used by the HTTP layer and the CLI.
#[derive(Clone)]
pub struct AssessmentService {
    store: Arc<dyn DocumentStore>,
    catalog: SheetCatalog,
    resolver: MasterSheetResolver,
    capabilities: CapabilityRepository,
    hierarchy: HierarchyBuilder,
    initiatives: InitiativeRepository,
}

impl AssessmentService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        let catalog = SheetCatalog::new(store.clone());
        Self {
            resolver: MasterSheetResolver::new(catalog.clone()),
            capabilities: CapabilityRepository::new(store.clone()),
            hierarchy: HierarchyBuilder::new(store.clone()),
            initiatives: InitiativeRepository::new(store.clone()),
            catalog,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn catalog(&self) -> &SheetCatalog {
        &self.catalog
    }

    pub fn resolver(&self) -> &MasterSheetResolver {
        &self.resolver
    }

    pub fn capabilities(&self) -> &CapabilityRepository {
        &self.capabilities
    }

    pub fn hierarchy(&self) -> &HierarchyBuilder {
        &self.hierarchy
    }

    pub fn initiatives(&self) -> &InitiativeRepository {
        &self.initiatives
    }

    pub async fn maturity_mapper(&self) -> Result<MaturityMapper> {
        MaturityMapper::load(&self.catalog).await
    }

    pub async fn maturity(&self, business: &str, technology: &str) -> Result<MaturityLookup> {
        let mapper = self.maturity_mapper().await?;
        let numbers = mapper.numbers(business, technology);
        Ok(MaturityLookup {
            maturity_level: mapper.level(business, technology),
            business_number: numbers.business_number,
            technology_number: numbers.technology_number,
        })
    }

    /// Merge that derives `maturityLevel` when the caller omits it and both
    /// effective maturity levels are known.
    pub async fn assess(&self, mut update: CapabilityUpdate) -> Result<MergeOutcome> {
        if update.maturity_level.is_none() {
            let identity = self.capabilities.complete_identity(&update.identity).await?;
            let stored = self.capabilities.find(&identity).await?.unwrap_or_default();
            let business = update.business_maturity.clone().or(stored.business_maturity);
            let technology = update.technology_maturity.clone().or(stored.technology_maturity);
            if let (Some(business), Some(technology)) = (present(&business), present(&technology)) {
                let level = self.maturity_mapper().await?.level(business, technology);
                debug!(%business, %technology, %level, "derived maturity level");
                update.maturity_level = Some(level);
            } else if present(&stored.maturity_level).is_some() {
                // One level was cleared; the composite label no longer applies.
                update.maturity_level = Some(String::new());
            }
        }
        self.capabilities.merge(&update).await
    }

    /// Seeds the chain from the Capability Master when its entry's business type is known.
    pub async fn capabilities_for_value_chain(&self, value_chain_id: &str) -> Result<Vec<Capability>> {
        let chain = self
            .hierarchy
            .value_chain(value_chain_id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(format!("value chain `{value_chain_id}`")))?;
        let entry = self.hierarchy.entry_by_id(&chain.value_chain_entry_id).await?;
        if let Some(entry) = entry.filter(|e| !e.business_type.trim().is_empty()) {
            let names = self
                .resolver
                .capability_names_for_stage(&chain.name, &entry.business_type)
                .await?;
            if !names.is_empty() {
                self.capabilities.seed(&chain, &names).await?;
            }
        }
        self.capabilities.list_for_value_chain(value_chain_id).await
    }

    /// Legacy embedded shape of an entry, computed from the normalized collections.
    pub async fn project_submission(&self, entry_id: &str) -> Result<Submission> {
        let entry = self
            .hierarchy
            .entry_by_id(entry_id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(format!("value chain entry `{entry_id}`")))?;

        let mut value_chain = Vec::new();
        for chain in self.hierarchy.value_chains_for_entry(entry_id).await? {
            let mut capability = self.capabilities.list_for_value_chain(&chain.id).await?;
            for legacy in &chain.capability {
                let name = match legacy {
                    JsonValue::String(name) => Some(name.as_str()),
                    JsonValue::Object(obj) => obj.get("name").and_then(JsonValue::as_str),
                    _ => None,
                };
                let Some(name) = name.filter(|n| !n.trim().is_empty()) else {
                    continue;
                };
                let key = normalize_key(name);
                if !capability.iter().any(|c| normalize_key(&c.name) == key) {
                    capability.push(Capability {
                        name: name.trim().to_string(),
                        value_chain_id: Some(chain.id.clone()),
                        value_chain_name: Some(chain.name.clone()),
                        value_chain_entry_id: Some(entry.id.clone()),
                        value_chain_entry_name: Some(entry.name.clone()),
                        ..Default::default()
                    });
                }
            }
            value_chain.push(SubmissionValueChain {
                name: chain.name,
                star_rating: chain.star_rating,
                capability,
            });
        }

        Ok(Submission {
            value_chain_entry_name: entry.name,
            business_type: entry.business_type,
            label: entry.label,
            business_complexity: entry.business_complexity,
            annual_revenues: entry.annual_revenues,
            value_chain,
            timestamp: entry.timestamp,
        })
    }

    pub async fn suggestions_for(&self, capability_names: &[String], industry: &str) -> Result<Vec<BuyOrBuildSuggestion>> {
        let table = self.catalog.load_master(MasterSheet::BuyOrBuild).await?;
        let rows = parse_buy_or_build(&table)?;
        Ok(match_suggestions(&rows, capability_names, industry))
    }

    /// Bulk delete restricted to the hierarchy collections.
    pub async fn delete_all(&self, collection: &str) -> Result<u64> {
        if !collections::ADMIN_DELETABLE.contains(&collection) {
            return Err(ValidationError {
                field: "collection".to_string(),
                message: format!("`{collection}` cannot be bulk deleted"),
            }
            .into());
        }
        let deleted = self.store.delete_many(collection, &Filter::new()).await?;
        warn!(%collection, deleted, "collection cleared");
        Ok(deleted)
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let hierarchy_backfilled = self.hierarchy.backfill_keys().await?;
        let mut report = self.capabilities.reconcile().await?;
        report.hierarchy_backfilled = hierarchy_backfilled;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vca_sheets::SheetTable;
    use vca_storage::MemoryStore;

    fn service() -> AssessmentService {
        AssessmentService::new(MemoryStore::shared())
    }

    async fn sourcing_chain(svc: &AssessmentService) -> ValueChain {
        let entry_id = svc
            .hierarchy()
            .upsert_value_chain_entry("Acme", "Retail", "Value chain", &EntryDetails::default())
            .await
            .unwrap();
        svc.hierarchy()
            .upsert_value_chains(
                &entry_id,
                "Acme",
                &[ValueChainInput {
                    name: "Sourcing".into(),
                    ..Default::default()
                }],
            )
            .await
            .unwrap();
        svc.hierarchy()
            .value_chains_for_entry(&entry_id)
            .await
            .unwrap()
            .remove(0)
    }

    fn grid(sheet: &str, rows: serde_json::Value) -> SheetTable {
        SheetTable::from_payload(sheet, &rows).unwrap()
    }

    fn cap_row(stage: &str, name: &str, industries: &str) -> CapabilityMasterRow {
        CapabilityMasterRow {
            value_chain_stage: stage.into(),
            capability_name: name.into(),
            description: format!("{name} keeps things running. More detail follows."),
            short_description: None,
            industries: industries.into(),
        }
    }

    #[test]
    fn short_description_takes_first_sentence_and_caps_length() {
        assert_eq!(short_description("Tracks suppliers. Scores risk."), "Tracks suppliers.");
        assert_eq!(short_description("v2.0 rollout plan"), "v2.0 rollout plan");
        assert_eq!(short_description(&"x".repeat(200)).chars().count(), 120);
        assert_eq!(short_description(""), "");
    }

    #[test]
    fn every_requested_name_yields_a_frame() {
        let caps = vec![
            cap_row("Sourcing", "Supplier Risk Mgmt", "Retail, CPG"),
            cap_row("sourcing", "supplier risk mgmt", "Retail"),
            cap_row("Logistics", "Route Planning", "CPG"),
        ];
        let names = vec!["Sourcing".to_string(), "Logistics".to_string(), "Marketing".to_string(), "SOURCING".to_string()];
        let resolved = resolve_from_rows(&[], &caps, &names, "Retail");

        let frame_names: Vec<_> = resolved.frames.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(frame_names, vec!["Sourcing", "Logistics", "Marketing"]);
        assert_eq!(resolved.capabilities_by_frame["Sourcing"].len(), 1);
        assert_eq!(
            resolved.capabilities_by_frame["Sourcing"][0].short_description,
            "Supplier Risk Mgmt keeps things running."
        );
        assert!(resolved.capabilities_by_frame["Logistics"].is_empty());
        assert!(resolved.capabilities_by_frame["Marketing"].is_empty());
    }

    #[test]
    fn value_chain_master_supplies_label_and_description() {
        let chains = vec![ValueChainMasterRow {
            industry: "Retail".into(),
            value_chain_stage: "Source to Pay".into(),
            name: "Procurement".into(),
            description: "Buying things".into(),
        }];
        let caps = vec![cap_row("Source to Pay", "Supplier Onboarding", "Retail")];
        let resolved = resolve_from_rows(&chains, &caps, &["procurement".to_string()], "retail");
        assert_eq!(
            resolved.frames,
            vec![Frame {
                name: "Source to Pay".into(),
                description: "Buying things".into()
            }]
        );
        assert_eq!(resolved.capabilities_by_frame["Source to Pay"][0].name, "Supplier Onboarding");
    }

    #[tokio::test]
    async fn resolver_propagates_schema_mismatch() {
        let svc = service();
        svc.catalog()
            .replace(&grid(
                "Capability Master",
                json!([["Value Chain Stage", "Capabilty Nam"], ["Sourcing", "X"]]),
            ))
            .await
            .unwrap();
        let err = svc
            .resolver()
            .resolve_capabilities(&["Sourcing".to_string()], "Retail")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::SchemaMismatch(_)), "{err:?}");
    }

    #[tokio::test]
    async fn entry_upsert_is_idempotent() {
        let svc = service();
        let details = EntryDetails::default();
        let first = svc
            .hierarchy()
            .upsert_value_chain_entry("Acme", "Retail", "Value chain", &details)
            .await
            .unwrap();
        let second = svc
            .hierarchy()
            .upsert_value_chain_entry("Acme", "Retail", "Value chain", &details)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(svc.hierarchy().entries().await.unwrap().len(), 1);

        let err = svc
            .hierarchy()
            .upsert_value_chain_entry("Acme", " ", "", &details)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Validation(ref v) if v.field == "businessType"));
    }

    #[tokio::test]
    async fn value_chain_upsert_counts_and_keeps_embedded_capabilities() {
        let svc = service();
        let chain = sourcing_chain(&svc).await;
        assert!(chain.capability.is_empty());

        let counts = svc
            .hierarchy()
            .upsert_value_chains(
                &chain.value_chain_entry_id,
                "",
                &[
                    ValueChainInput {
                        name: "sourcing".into(),
                        star_rating: Some(4.0),
                        capability: None,
                    },
                    ValueChainInput {
                        name: "Logistics".into(),
                        star_rating: None,
                        capability: Some(vec![json!("Route Planning")]),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            counts,
            UpsertCounts {
                inserted_count: 1,
                updated_count: 1
            }
        );

        let chains = svc
            .hierarchy()
            .value_chains_for_entry(&chain.value_chain_entry_id)
            .await
            .unwrap();
        let sourcing = chains.iter().find(|c| c.id == chain.id).unwrap();
        assert_eq!(sourcing.star_rating, Some(4.0));
        assert_eq!(sourcing.value_chain_entry_name, "Acme");
        let logistics = chains.iter().find(|c| c.name == "Logistics").unwrap();
        assert_eq!(logistics.capability, vec![json!("Route Planning")]);
    }

    #[tokio::test]
    async fn merge_preserves_unspecified_fields() {
        let svc = service();
        let chain = sourcing_chain(&svc).await;
        let repo = svc.capabilities();

        let mut first = CapabilityUpdate::new(CapabilityIdentity::by_id(chain.id.clone(), "X"));
        first.business_maturity = Some("Managed".into());
        let created = repo.merge(&first).await.unwrap();
        assert!(created.created);

        let mut second = CapabilityUpdate::new(CapabilityIdentity::by_names("acme", "SOURCING", "x"));
        second.technology_maturity = Some("Homegrown".into());
        let updated = repo.merge(&second).await.unwrap();
        assert_eq!(updated.id, created.id);
        assert!(!updated.created);

        let stored = repo.get(&created.id).await.unwrap().unwrap();
        assert_eq!(stored.business_maturity.as_deref(), Some("Managed"));
        assert_eq!(stored.technology_maturity.as_deref(), Some("Homegrown"));
        assert_eq!(stored.value_chain_entry_name.as_deref(), Some("Acme"));
        assert_eq!(stored.value_chain_name.as_deref(), Some("Sourcing"));
        assert_eq!(stored.name, "X");
        assert_eq!(stored.value_chain_id.as_deref(), Some(chain.id.as_str()));
        assert!(stored.updated_at.is_some());
    }

    #[tokio::test]
    async fn list_for_entry_spans_every_chain_of_the_entry() {
        let svc = service();
        let chain = sourcing_chain(&svc).await;
        let repo = svc.capabilities();
        repo.merge(&CapabilityUpdate::new(CapabilityIdentity::by_id(chain.id.clone(), "X")))
            .await
            .unwrap();
        repo.merge(&CapabilityUpdate::new(CapabilityIdentity::by_names("Acme", "Logistics", "Route Planning")))
            .await
            .unwrap();
        repo.merge(&CapabilityUpdate::new(CapabilityIdentity::by_names("Globex", "Sourcing", "X")))
            .await
            .unwrap();

        let mut names: Vec<_> = repo
            .list_for_entry(" acme ")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["Route Planning", "X"]);
    }

    #[tokio::test]
    async fn entry_upsert_without_label_keeps_stored_label() {
        let svc = service();
        let details = EntryDetails::default();
        let id = svc
            .hierarchy()
            .upsert_value_chain_entry("Acme", "Retail", "Value chain", &details)
            .await
            .unwrap();
        svc.hierarchy()
            .upsert_value_chain_entry("Acme", "Retail", "", &details)
            .await
            .unwrap();
        let entry = svc.hierarchy().entry_by_id(&id).await.unwrap().unwrap();
        assert_eq!(entry.label, "Value chain");
    }

    #[tokio::test]
    async fn explicit_empty_string_clears_a_field() {
        let svc = service();
        let chain = sourcing_chain(&svc).await;
        let mut update = CapabilityUpdate::new(CapabilityIdentity::by_id(chain.id.clone(), "X"));
        update.business_owner = Some("Dana".into());
        let outcome = svc.capabilities().merge(&update).await.unwrap();

        update.business_owner = Some(String::new());
        svc.capabilities().merge(&update).await.unwrap();
        let stored = svc.capabilities().get(&outcome.id).await.unwrap().unwrap();
        assert_eq!(stored.business_owner.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn seeding_never_overwrites_existing_records() {
        let svc = service();
        let chain = sourcing_chain(&svc).await;
        let mut assessed = CapabilityUpdate::new(CapabilityIdentity::by_id(chain.id.clone(), "X"));
        assessed.business_maturity = Some("Managed".into());
        let outcome = svc.capabilities().merge(&assessed).await.unwrap();
        let before = svc.store().find(collections::CAPABILITIES, &Filter::by_id(&outcome.id)).await.unwrap();

        let report = svc
            .capabilities()
            .seed(&chain, &["X".to_string(), "Y".to_string(), "y ".to_string()])
            .await
            .unwrap();
        assert_eq!(report, SeedReport { inserted: 1, existing: 1 });

        let after = svc.store().find(collections::CAPABILITIES, &Filter::by_id(&outcome.id)).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(svc.capabilities().list_for_value_chain(&chain.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_existing_reports_missing_records() {
        let svc = service();
        let chain = sourcing_chain(&svc).await;
        let mut update = CapabilityUpdate::new(CapabilityIdentity::by_id(chain.id.clone(), "Nope"));
        update.tech_owner = Some("Lee".into());
        let err = svc.capabilities().update_existing(&update).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound(_)));

        let err = svc
            .capabilities()
            .merge(&CapabilityUpdate::new(CapabilityIdentity::by_id("", "X")))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Validation(ref v) if v.field == "valueChainEntryName"));
    }

    #[tokio::test]
    async fn assess_derives_maturity_level_from_stored_and_incoming_levels() {
        let svc = service();
        svc.catalog()
            .replace(&grid(
                "Maturity Mapping",
                json!([
                    ["Business Maturity Level", "Technology Maturity Level", "Maturity Level"],
                    ["Managed", "Homegrown", "Developing"]
                ]),
            ))
            .await
            .unwrap();
        let chain = sourcing_chain(&svc).await;

        let mut first = CapabilityUpdate::new(CapabilityIdentity::by_id(chain.id.clone(), "X"));
        first.business_maturity = Some("Managed".into());
        let outcome = svc.assess(first).await.unwrap();
        let stored = svc.capabilities().get(&outcome.id).await.unwrap().unwrap();
        assert_eq!(stored.maturity_level, None);

        let mut second = CapabilityUpdate::new(CapabilityIdentity::by_id(chain.id.clone(), "X"));
        second.technology_maturity = Some("homegrown".into());
        svc.assess(second).await.unwrap();
        let stored = svc.capabilities().get(&outcome.id).await.unwrap().unwrap();
        assert_eq!(stored.maturity_level.as_deref(), Some("Developing"));

        let mut cleared = CapabilityUpdate::new(CapabilityIdentity::by_id(chain.id.clone(), "X"));
        cleared.business_maturity = Some(String::new());
        svc.assess(cleared).await.unwrap();
        let stored = svc.capabilities().get(&outcome.id).await.unwrap().unwrap();
        assert_eq!(stored.assessment_state(), vca_core::AssessmentState::PartiallyAssessed);
        assert_eq!(stored.maturity_level.as_deref(), Some(""));

        let mut restored = CapabilityUpdate::new(CapabilityIdentity::by_id(chain.id.clone(), "X"));
        restored.business_maturity = Some("Managed".into());
        svc.assess(restored).await.unwrap();
        let stored = svc.capabilities().get(&outcome.id).await.unwrap().unwrap();
        assert_eq!(stored.maturity_level.as_deref(), Some("Developing"));
    }

    #[tokio::test]
    async fn capabilities_for_value_chain_seeds_from_master() {
        let svc = service();
        svc.catalog()
            .replace(&grid(
                "Capability Master",
                json!([
                    ["Value Chain Stage", "Capability Name", "Description", "Industries"],
                    ["Sourcing", "Supplier Risk Mgmt", "Scores suppliers.", "Retail, CPG"],
                    ["Sourcing", "Spend Analytics", "", "Healthcare"]
                ]),
            ))
            .await
            .unwrap();
        let chain = sourcing_chain(&svc).await;

        let caps = svc.capabilities_for_value_chain(&chain.id).await.unwrap();
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].name, "Supplier Risk Mgmt");
        assert_eq!(caps[0].assessment_state(), vca_core::AssessmentState::Unassessed);

        // Second read does not duplicate.
        assert_eq!(svc.capabilities_for_value_chain(&chain.id).await.unwrap().len(), 1);
        assert!(matches!(
            svc.capabilities_for_value_chain("missing").await.unwrap_err(),
            ReconcileError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn submission_projection_appends_legacy_embedded_names() {
        let svc = service();
        let chain = sourcing_chain(&svc).await;
        svc.hierarchy()
            .upsert_value_chains(
                &chain.value_chain_entry_id,
                "Acme",
                &[ValueChainInput {
                    name: "Sourcing".into(),
                    star_rating: Some(3.0),
                    capability: Some(vec![json!({"name": "Legacy Cap"}), json!("x")]),
                }],
            )
            .await
            .unwrap();
        let mut update = CapabilityUpdate::new(CapabilityIdentity::by_id(chain.id.clone(), "X"));
        update.business_maturity = Some("Managed".into());
        svc.capabilities().merge(&update).await.unwrap();

        let submission = svc.project_submission(&chain.value_chain_entry_id).await.unwrap();
        assert_eq!(submission.value_chain_entry_name, "Acme");
        assert_eq!(submission.business_type, "Retail");
        let names: Vec<_> = submission.value_chain[0].capability.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["X", "Legacy Cap"]);
        assert_eq!(submission.value_chain[0].star_rating, Some(3.0));
    }

    #[tokio::test]
    async fn reconcile_collapses_divergent_records() {
        let svc = service();
        let chain = sourcing_chain(&svc).await;
        let store = svc.store();
        let legacy = json!({
            "valueChainEntryName": "Acme",
            "valueChainName": "Sourcing",
            "name": "Supplier Risk Mgmt",
            "businessOwner": "Ana",
            "updatedAt": "2024-01-01T00:00:00Z"
        });
        let newer = json!({
            "valueChainId": chain.id,
            "name": "supplier risk mgmt",
            "businessMaturity": "Managed",
            "updatedAt": "2024-06-01T00:00:00Z"
        });
        store
            .insert_one(collections::CAPABILITIES, to_document(&legacy).unwrap())
            .await
            .unwrap();
        let survivor_id = store
            .insert_one(collections::CAPABILITIES, to_document(&newer).unwrap())
            .await
            .unwrap();

        let report = svc.reconcile().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.merged_groups, 1);
        assert_eq!(report.deleted, 1);

        let remaining = svc.capabilities().list_for_value_chain(&chain.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, survivor_id);
        assert_eq!(remaining[0].business_maturity.as_deref(), Some("Managed"));
        assert_eq!(remaining[0].business_owner.as_deref(), Some("Ana"));
        assert_eq!(remaining[0].value_chain_entry_name.as_deref(), Some("Acme"));

        let found = svc
            .capabilities()
            .find(&CapabilityIdentity::by_names("ACME", "sourcing", "Supplier Risk Mgmt"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, survivor_id);

        let again = svc.reconcile().await.unwrap();
        assert_eq!((again.backfilled, again.deleted), (0, 0));
    }

    #[tokio::test]
    async fn initiatives_upsert_by_name_and_entry() {
        let svc = service();
        let mut initiative = Initiative {
            initiative_name: "Supplier 360".into(),
            value_chain_entry_name: "Acme".into(),
            initiative_owner: "Ana".into(),
            ..Default::default()
        };
        let first = svc.initiatives().upsert_initiative(&initiative).await.unwrap();
        initiative.initiative_name = "supplier 360 ".into();
        initiative.initiative_owner = "Lee".into();
        let second = svc.initiatives().upsert_initiative(&initiative).await.unwrap();
        assert_eq!(first, second);

        let listed = svc.initiatives().initiatives_for("ACME").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].initiative_owner, "Lee");

        initiative.value_chain_entry_name = String::new();
        assert!(matches!(
            svc.initiatives().upsert_initiative(&initiative).await.unwrap_err(),
            ReconcileError::Validation(_)
        ));
    }

    #[test]
    fn buy_or_build_matches_name_and_industry() {
        let rows = vec![
            BuyOrBuildRow {
                capability_name: "Supplier Risk Mgmt".into(),
                industry: "Retail".into(),
                description: "Buy".into(),
                suggestions: vec!["Vendor A".into(), "Vendor B".into()],
            },
            BuyOrBuildRow {
                capability_name: "supplier risk mgmt".into(),
                industry: "".into(),
                description: "".into(),
                suggestions: vec!["Vendor B".into(), "Build in-house".into()],
            },
            BuyOrBuildRow {
                capability_name: "Route Planning".into(),
                industry: "Healthcare".into(),
                description: "".into(),
                suggestions: vec!["Vendor C".into()],
            },
        ];
        let out = match_suggestions(
            &rows,
            &["Supplier Risk Mgmt".to_string(), "Route Planning".to_string()],
            "retail",
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].suggestions, vec!["Vendor A", "Vendor B", "Build in-house"]);
    }

    #[tokio::test]
    async fn bulk_delete_is_limited_to_hierarchy_collections() {
        let svc = service();
        sourcing_chain(&svc).await;
        assert_eq!(svc.delete_all(collections::VALUE_CHAINS).await.unwrap(), 1);
        let err = svc.delete_all(collections::SHEET_ALIASES).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Validation(ref v) if v.field == "collection"));
    }
}
