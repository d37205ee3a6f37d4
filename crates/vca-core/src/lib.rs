//! Core domain model and text-key normalization for VCA.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "vca-core";

/// Collection names shared by every layer that touches the document store.
pub mod collections {
    pub const SUBMISSIONS: &str = "Submissions";
    pub const VALUE_CHAIN_ENTRIES: &str = "ValueChainEntries";
    pub const VALUE_CHAINS: &str = "ValueChains";
    pub const CAPABILITIES: &str = "Capabilities";
    pub const INITIATIVES: &str = "Initiatives";
    pub const SHEET_RELATIONS: &str = "SheetRelations";
    pub const SHEET_ALIASES: &str = "SheetAliases";

    /// Collections an administrator may wipe with a bulk delete.
    pub const ADMIN_DELETABLE: &[&str] = &[
        SUBMISSIONS,
        VALUE_CHAIN_ENTRIES,
        VALUE_CHAINS,
        CAPABILITIES,
        INITIATIVES,
    ];

    /// Every collection the application owns; sheet names may not shadow these.
    pub const RESERVED: &[&str] = &[
        SUBMISSIONS,
        VALUE_CHAIN_ENTRIES,
        VALUE_CHAINS,
        CAPABILITIES,
        INITIATIVES,
        SHEET_RELATIONS,
        SHEET_ALIASES,
    ];

    /// Case, spacing and punctuation are ignored.
    pub fn is_reserved(name: &str) -> bool {
        let key = crate::normalize_key(name).replace(' ', "");
        RESERVED
            .iter()
            .any(|reserved| crate::normalize_key(reserved) == key)
    }
}

/// Canonical comparison key for free-text identifiers.
///
/// Trims, lower-cases, rewrites `&` as `and`, drops everything outside
/// `[a-z0-9 ]` and collapses whitespace. The `&` rewrite happens before the
/// strip, so `"R&D"` becomes `"randd"`.
pub fn normalize_key(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .replace('&', "and")
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else if c.is_whitespace() {
                ' '
            } else {
                '\u{0}'
            }
        })
        .filter(|c| *c != '\u{0}')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a comma-separated cell (e.g. an `Industries` column) into normalized keys.
pub fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(normalize_key)
        .filter(|item| !item.is_empty())
        .collect()
}

/// Whether a comma-separated cell contains `needle` once both sides are normalized.
pub fn list_contains(list: &str, needle: &str) -> bool {
    let needle = normalize_key(needle);
    !needle.is_empty() && split_list(list).iter().any(|item| *item == needle)
}

/// Reference sheets imported from spreadsheets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MasterSheet {
    ValueChainMaster,
    CapabilityMaster,
    MaturityMapping,
    CapabilityMaturityModel,
    BuyOrBuild,
}

impl MasterSheet {
    pub const ALL: [MasterSheet; 5] = [
        MasterSheet::ValueChainMaster,
        MasterSheet::CapabilityMaster,
        MasterSheet::MaturityMapping,
        MasterSheet::CapabilityMaturityModel,
        MasterSheet::BuyOrBuild,
    ];

    pub fn sheet_name(self) -> &'static str {
        match self {
            MasterSheet::ValueChainMaster => "Value Chain Master",
            MasterSheet::CapabilityMaster => "Capability Master",
            MasterSheet::MaturityMapping => "Maturity Mapping",
            MasterSheet::CapabilityMaturityModel => "Capability Maturity Model",
            MasterSheet::BuyOrBuild => "Buy or Build",
        }
    }

    /// Resolve a user-supplied sheet name by normalized comparison.
    pub fn from_sheet_name(name: &str) -> Option<Self> {
        let key = normalize_key(name);
        Self::ALL
            .into_iter()
            .find(|sheet| normalize_key(sheet.sheet_name()) == key)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn missing(field: &str) -> Self {
        Self {
            field: field.to_string(),
            message: "is required".to_string(),
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::missing(field))
    } else {
        Ok(())
    }
}

/// Optional profile fields captured on the "Business Complexity" step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_complexity: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annual_revenues: Option<JsonValue>,
}

/// Root of one assessment: a named business profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueChainEntry {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub business_type: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_complexity: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annual_revenues: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// One stage of an entry's value chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueChain {
    #[serde(rename = "_id")]
    pub id: String,
    pub value_chain_entry_id: String,
    #[serde(default)]
    pub value_chain_entry_name: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub star_rating: Option<f64>,
    /// Legacy embedded capability list; the `Capabilities` collection is authoritative.
    #[serde(rename = "Capability", default)]
    pub capability: Vec<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Incoming value chain for a hierarchy upsert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueChainInput {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub star_rating: Option<f64>,
    /// `Some` replaces the stored list, `None` leaves it untouched.
    #[serde(rename = "Capability", default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<Vec<JsonValue>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssessmentState {
    Unassessed,
    PartiallyAssessed,
    FullyAssessed,
}

/// A capability record; unset assessment fields mean "never assessed".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_chain_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_chain_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_chain_entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_chain_entry_name: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_maturity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technology_maturity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maturity_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tech_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Capability {
    pub fn assessment_state(&self) -> AssessmentState {
        let set = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        match (set(&self.business_maturity), set(&self.technology_maturity)) {
            (true, true) => AssessmentState::FullyAssessed,
            (false, false) => AssessmentState::Unassessed,
            _ => AssessmentState::PartiallyAssessed,
        }
    }
}

/// Either identity shape a caller may know a capability by.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityIdentity {
    #[serde(default)]
    pub value_chain_id: Option<String>,
    #[serde(default)]
    pub value_chain_entry_id: Option<String>,
    #[serde(default)]
    pub value_chain_entry_name: Option<String>,
    #[serde(default)]
    pub value_chain_name: Option<String>,
    #[serde(default)]
    pub name: String,
}

impl CapabilityIdentity {
    pub fn by_id(value_chain_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            value_chain_id: Some(value_chain_id.into()),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn by_names(
        value_chain_entry_name: impl Into<String>,
        value_chain_name: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            value_chain_entry_name: Some(value_chain_entry_name.into()),
            value_chain_name: Some(value_chain_name.into()),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn value_chain_id(&self) -> Option<&str> {
        non_blank(self.value_chain_id.as_deref())
    }

    /// `(entry name, value chain name)` when both are known.
    pub fn display_names(&self) -> Option<(&str, &str)> {
        Some((
            non_blank(self.value_chain_entry_name.as_deref())?,
            non_blank(self.value_chain_name.as_deref())?,
        ))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require("name", &self.name)?;
        if self.value_chain_id().is_none() && self.display_names().is_none() {
            let field = if non_blank(self.value_chain_entry_name.as_deref()).is_none() {
                "valueChainEntryName"
            } else {
                "valueChainName"
            };
            return Err(ValidationError {
                field: field.to_string(),
                message: "is required when valueChainId is absent".to_string(),
            });
        }
        Ok(())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Partial assessment update. `None` keeps the stored value, `Some("")` clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityUpdate {
    #[serde(flatten)]
    pub identity: CapabilityIdentity,
    #[serde(default)]
    pub business_maturity: Option<String>,
    #[serde(default)]
    pub technology_maturity: Option<String>,
    #[serde(default)]
    pub maturity_level: Option<String>,
    #[serde(default)]
    pub business_owner: Option<String>,
    #[serde(default)]
    pub tech_owner: Option<String>,
}

impl CapabilityUpdate {
    pub fn new(identity: CapabilityIdentity) -> Self {
        Self {
            identity,
            ..Default::default()
        }
    }

    /// Stored field names paired with the values explicitly supplied.
    pub fn assessment_fields(&self) -> Vec<(&'static str, &str)> {
        [
            ("businessMaturity", &self.business_maturity),
            ("technologyMaturity", &self.technology_maturity),
            ("maturityLevel", &self.maturity_level),
            ("businessOwner", &self.business_owner),
            ("techOwner", &self.tech_owner),
        ]
        .into_iter()
        .filter_map(|(field, value)| value.as_deref().map(|v| (field, v)))
        .collect()
    }
}

/// Legacy denormalized mirror of the entry hierarchy. Read-only projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub value_chain_entry_name: String,
    pub business_type: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_complexity: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annual_revenues: Option<JsonValue>,
    #[serde(rename = "ValueChain")]
    pub value_chain: Vec<SubmissionValueChain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionValueChain {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub star_rating: Option<f64>,
    #[serde(rename = "Capability")]
    pub capability: Vec<Capability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedSuggestion {
    pub capability_name: String,
    #[serde(default)]
    pub frame_name: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Initiative {
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub initiative_name: String,
    #[serde(default)]
    pub initiative_owner: String,
    #[serde(default)]
    pub initiative_scope: String,
    #[serde(default)]
    pub initiative_function: String,
    #[serde(default)]
    pub value_chain_entry_name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub selected_suggestions: Vec<SelectedSuggestion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Initiative {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require("initiativeName", &self.initiative_name)?;
        require("valueChainEntryName", &self.value_chain_entry_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueChainMasterRow {
    pub industry: String,
    pub value_chain_stage: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityMasterRow {
    pub value_chain_stage: String,
    pub capability_name: String,
    pub description: String,
    pub short_description: Option<String>,
    pub industries: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaturityMappingRow {
    pub business_maturity_level: String,
    pub technology_maturity_level: String,
    pub maturity_level: String,
    pub business_maturity_number: Option<f64>,
    pub technology_maturity_number: Option<f64>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyOrBuildRow {
    pub capability_name: String,
    pub industry: String,
    pub description: String,
    pub suggestions: Vec<String>,
}
