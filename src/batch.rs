//! Grouping readings into a single outbound message
//!
//! Readings are keyed by their normalized asset name and emitted as one JSON
//! object per call: `{"<asset>": [<reading>, ...], ...}`. Assets appear in
//! sorted order; readings within an asset keep their input order.

use crate::protocol::Reading;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Replace every whitespace character with an underscore, one for one
pub fn normalize_identity(identity: &str) -> String {
    identity
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Every normalized asset name the client has seen. Never shrinks.
#[derive(Debug, Default, Clone)]
pub struct AssetRegistry {
    assets: BTreeSet<String>,
}

impl AssetRegistry {
    /// Returns true when the asset was not known before
    pub fn register(&mut self, asset: &str) -> bool {
        if self.assets.contains(asset) {
            return false;
        }
        self.assets.insert(asset.to_string())
    }

    pub fn contains(&self, asset: &str) -> bool {
        self.assets.contains(asset)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.assets.iter().map(String::as_str)
    }
}

/// Serialized payload and the number of readings it carries
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledBatch {
    pub payload: String,
    pub reading_count: usize,
    pub asset_count: usize,
}

impl AssembledBatch {
    pub fn is_empty(&self) -> bool {
        self.reading_count == 0
    }
}

#[derive(Debug, Default)]
pub struct BatchAssembler {
    registry: AssetRegistry,
}

impl BatchAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &AssetRegistry {
        &self.registry
    }

    /// Group `readings` by normalized asset in a single pass
    pub fn assemble(&mut self, readings: &[Reading]) -> AssembledBatch {
        let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for reading in readings {
            let asset = normalize_identity(reading.asset_code());
            self.registry.register(&asset);
            groups
                .entry(asset)
                .or_default()
                .push(reading.to_payload_object());
        }

        let reading_count = groups.values().map(Vec::len).sum();
        let asset_count = groups.len();

        let mut root = Map::with_capacity(asset_count);
        for (asset, entries) in groups {
            root.insert(asset, Value::Array(entries));
        }

        AssembledBatch {
            payload: Value::Object(root).to_string(),
            reading_count,
            asset_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    fn reading(asset: &str, value: i64) -> Reading {
        Reading::new(asset, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .with_datapoint("value", value)
    }

    #[test]
    fn test_normalize_replaces_whitespace_one_for_one() {
        assert_eq!(normalize_identity("Room A"), "Room_A");
        assert_eq!(normalize_identity("  lead"), "__lead");
        assert_eq!(normalize_identity("tab\there"), "tab_here");
        assert_eq!(normalize_identity("a-b.c/d"), "a-b.c/d");
        assert_eq!(normalize_identity(""), "");
    }

    #[test]
    fn test_empty_batch_yields_empty_object() {
        let mut assembler = BatchAssembler::new();
        let batch = assembler.assemble(&[]);
        assert_eq!(batch.payload, "{}");
        assert_eq!(batch.reading_count, 0);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_assets_are_sorted_and_readings_keep_order() {
        let mut assembler = BatchAssembler::new();
        let batch = assembler.assemble(&[reading("pump", 1), reading("fan", 2), reading("pump", 3)]);

        let value: Value = serde_json::from_str(&batch.payload).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["fan", "pump"]);
        assert_eq!(value["pump"][0]["value"], json!(1));
        assert_eq!(value["pump"][1]["value"], json!(3));
        assert_eq!(batch.asset_count, 2);
    }

    #[test]
    fn test_registry_accumulates_but_absent_assets_are_omitted() {
        let mut assembler = BatchAssembler::new();
        assembler.assemble(&[reading("old asset", 1)]);
        let batch = assembler.assemble(&[reading("new", 2)]);

        assert!(assembler.registry().contains("old_asset"));
        assert!(assembler.registry().contains("new"));
        assert_eq!(assembler.registry().len(), 2);

        let value: Value = serde_json::from_str(&batch.payload).unwrap();
        assert!(value.get("old_asset").is_none());
        assert_eq!(batch.reading_count, 1);
    }

    #[test]
    fn test_register_reports_novelty() {
        let mut registry = AssetRegistry::default();
        assert!(registry.register("a"));
        assert!(!registry.register("a"));
        assert_eq!(registry.iter().collect::<Vec<_>>(), vec!["a"]);
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(identity in "\\PC*") {
            let once = normalize_identity(&identity);
            prop_assert_eq!(normalize_identity(&once), once.clone());
            prop_assert_eq!(once.chars().count(), identity.chars().count());
        }

        #[test]
        fn every_reading_lands_under_its_asset(
            assets in proptest::collection::vec("[a-c ]{1,4}", 1..40)
        ) {
            let readings: Vec<_> = assets
                .iter()
                .enumerate()
                .map(|(i, a)| reading(a, i as i64))
                .collect();

            let mut assembler = BatchAssembler::new();
            let batch = assembler.assemble(&readings);
            prop_assert_eq!(batch.reading_count, readings.len());

            let value: Value = serde_json::from_str(&batch.payload).unwrap();
            let total: usize = value
                .as_object()
                .unwrap()
                .values()
                .map(|v| v.as_array().unwrap().len())
                .sum();
            prop_assert_eq!(total, readings.len());

            for r in &readings {
                let group = value[normalize_identity(r.asset_code())].as_array().unwrap();
                prop_assert!(group.iter().any(|e| e["value"] == r.datapoints()["value"]));
            }
        }
    }
}
