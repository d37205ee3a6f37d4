//! Composite maturity lookup over the Maturity Mapping sheet.

use std::collections::HashSet;

use serde::Serialize;
use vca_core::{normalize_key, MasterSheet, MaturityMappingRow};
use vca_sheets::{parse_maturity_mapping, SheetCatalog};

use crate::Result;

/// Label for a (business, technology) pair; `""` when no row matches both.
pub fn lookup_maturity_level(mapping: &[MaturityMappingRow], business: &str, technology: &str) -> String {
    let business = normalize_key(business);
    let technology = normalize_key(technology);
    if business.is_empty() || technology.is_empty() {
        return String::new();
    }
    mapping
        .iter()
        .find(|row| {
            normalize_key(&row.business_maturity_level) == business
                && normalize_key(&row.technology_maturity_level) == technology
        })
        .map(|row| row.maturity_level.clone())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaturityNumbers {
    pub business_number: Option<f64>,
    pub technology_number: Option<f64>,
}

/// Each number comes from the first row matching its own level; the two rows may differ.
pub fn lookup_maturity_numbers(
    mapping: &[MaturityMappingRow],
    business: &str,
    technology: &str,
) -> MaturityNumbers {
    let business = normalize_key(business);
    let technology = normalize_key(technology);
    MaturityNumbers {
        business_number: (!business.is_empty())
            .then(|| {
                mapping
                    .iter()
                    .filter(|row| normalize_key(&row.business_maturity_level) == business)
                    .find_map(|row| row.business_maturity_number)
            })
            .flatten(),
        technology_number: (!technology.is_empty())
            .then(|| {
                mapping
                    .iter()
                    .filter(|row| normalize_key(&row.technology_maturity_level) == technology)
                    .find_map(|row| row.technology_maturity_number)
            })
            .flatten(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaturityLevels {
    pub business: Vec<String>,
    pub technology: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MaturityMapper {
    rows: Vec<MaturityMappingRow>,
}

impl MaturityMapper {
    pub fn from_rows(rows: Vec<MaturityMappingRow>) -> Self {
        Self { rows }
    }

    /// Reads `Maturity Mapping`, falling back to `Capability Maturity Model` when it is empty.
    pub async fn load(catalog: &SheetCatalog) -> Result<Self> {
        let rows = parse_maturity_mapping(&catalog.load_master(MasterSheet::MaturityMapping).await?)?;
        if !rows.is_empty() {
            return Ok(Self::from_rows(rows));
        }
        let model = catalog.load_master(MasterSheet::CapabilityMaturityModel).await?;
        Ok(Self::from_rows(parse_maturity_mapping(&model)?))
    }

    pub fn rows(&self) -> &[MaturityMappingRow] {
        &self.rows
    }

    pub fn level(&self, business: &str, technology: &str) -> String {
        lookup_maturity_level(&self.rows, business, technology)
    }

    pub fn numbers(&self, business: &str, technology: &str) -> MaturityNumbers {
        lookup_maturity_numbers(&self.rows, business, technology)
    }

    /// Distinct level labels in sheet order, for assessment pickers.
    pub fn levels(&self) -> MaturityLevels {
        fn distinct<'a>(values: impl Iterator<Item = &'a String>) -> Vec<String> {
            let mut seen = HashSet::new();
            values
                .filter(|v| !v.trim().is_empty() && seen.insert(normalize_key(v)))
                .cloned()
                .collect()
        }
        MaturityLevels {
            business: distinct(self.rows.iter().map(|r| &r.business_maturity_level)),
            technology: distinct(self.rows.iter().map(|r| &r.technology_maturity_level)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(business: &str, technology: &str, label: &str, bn: Option<f64>, tn: Option<f64>) -> MaturityMappingRow {
        MaturityMappingRow {
            business_maturity_level: business.into(),
            technology_maturity_level: technology.into(),
            maturity_level: label.into(),
            business_maturity_number: bn,
            technology_maturity_number: tn,
            description: String::new(),
        }
    }

    fn mapping() -> Vec<MaturityMappingRow> {
        vec![
            row("Managed", "Homegrown", "Developing", Some(2.0), None),
            row("Managed", "Best of Breed", "Established", None, None),
            row("Optimized", "Homegrown", "Established", Some(4.0), Some(1.0)),
        ]
    }

    #[test]
    fn level_requires_both_levels_in_the_same_row() {
        let rows = mapping();
        assert_eq!(lookup_maturity_level(&rows, "managed ", "HOMEGROWN"), "Developing");
        assert_eq!(lookup_maturity_level(&rows, "Optimized", "Best of Breed"), "");
    }

    #[test]
    fn unknown_levels_are_an_empty_label_not_an_error() {
        assert_eq!(lookup_maturity_level(&mapping(), "Unknown", "Unknown"), "");
        assert_eq!(lookup_maturity_level(&mapping(), "", ""), "");
        assert_eq!(lookup_maturity_level(&[], "Managed", "Homegrown"), "");
    }

    #[test]
    fn numbers_are_found_independently() {
        let numbers = lookup_maturity_numbers(&mapping(), "Managed", "Homegrown");
        assert_eq!(numbers.business_number, Some(2.0));
        // The technology number only exists on the Optimized row.
        assert_eq!(numbers.technology_number, Some(1.0));

        let none = lookup_maturity_numbers(&mapping(), "Unknown", "");
        assert_eq!(none, MaturityNumbers::default());
    }

    #[tokio::test]
    async fn empty_mapping_falls_back_to_capability_maturity_model() {
        let catalog = SheetCatalog::new(vca_storage::MemoryStore::shared());
        let model = vca_sheets::SheetTable::from_payload(
            "Capability Maturity Model",
            &serde_json::json!([
                ["Business Maturity", "Technology Maturity", "Maturity Level"],
                ["Managed", "Homegrown", "Developing"]
            ]),
        )
        .unwrap();
        catalog.replace(&model).await.unwrap();

        let mapper = MaturityMapper::load(&catalog).await.unwrap();
        assert_eq!(mapper.rows().len(), 1);
        assert_eq!(mapper.level("Managed", "Homegrown"), "Developing");

        let mapping = vca_sheets::SheetTable::from_payload(
            "Maturity Mapping",
            &serde_json::json!([
                ["Business Maturity Level", "Technology Maturity Level", "Maturity Level"],
                ["Managed", "Homegrown", "Established"]
            ]),
        )
        .unwrap();
        catalog.replace(&mapping).await.unwrap();
        let mapper = MaturityMapper::load(&catalog).await.unwrap();
        assert_eq!(mapper.level("Managed", "Homegrown"), "Established");
    }

    #[test]
    fn levels_are_distinct_in_sheet_order() {
        let levels = MaturityMapper::from_rows(mapping()).levels();
        assert_eq!(levels.business, vec!["Managed", "Optimized"]);
        assert_eq!(levels.technology, vec!["Homegrown", "Best of Breed"]);
    }
}
