//! Drivers pull data for one (source type, collection) pair.
//!
//! Concrete drivers live outside this crate. They are plugged in by registering
//! a [`DriverConstructor`] for a source type on a [`DriverFactory`], which then
//! builds one [`Driver`] per configured collection.
//!
//! # Configuration
//!
//! Collections may be declared as bare names or as structured objects:
//!
//! ```json
//! {
//!   "type": "crm",
//!   "destinations": ["warehouse"],
//!   "collections": ["contacts", {"name": "deals", "table_name": "crm_deals"}]
//! }
//! ```

pub mod factory;
pub mod granularity;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::sources::destinations::Storage;

pub use factory::{DriverConstructor, DriverError, DriverFactory};
pub use granularity::Granularity;

/// Extraction logic for one collection of one source.
///
/// `sync` may run for a long time and block on network I/O; it is always
/// invoked from a worker thread of the sync pool.
pub trait Driver: Send + Sync {
    fn sync(&self, destinations: &[Arc<dyn Storage>]) -> anyhow::Result<()>;
}

/// Drivers of one source keyed by collection name.
pub type DriverPerCollection = HashMap<String, Arc<dyn Driver>>;

/// Declarative configuration of one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source type used to resolve a driver constructor. Empty means "same as
    /// the source name".
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub source_type: String,
    /// Destination ids the extracted data is written to.
    #[serde(default)]
    pub destinations: Vec<String>,
    /// Raw collection entries: bare names or structured objects.
    #[serde(default)]
    pub collections: Vec<Value>,
    /// Opaque driver parameters.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
}

/// A normalized collection of a source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Collection {
    pub name: String,
    /// Collection type; defaults to the name.
    #[serde(rename = "type")]
    pub collection_type: String,
    /// Destination table override; empty means driver default.
    pub table_name: String,
    pub parameters: Map<String, Value>,
}

const COLLECTIONS_SHAPE_ERROR: &str =
    "failed to parse source collections as array of string or collections structure";

/// String field of a structured collection; anything but a string reads as empty.
fn string_field(def: &Map<String, Value>, key: &str) -> String {
    def.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl Collection {
    /// Collection whose type and name coincide.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            collection_type: name.clone(),
            name,
            table_name: String::new(),
            parameters: Map::new(),
        }
    }

    /// Decode one raw configuration entry: a bare name or a structured object.
    pub fn from_value(value: &Value) -> Result<Self, DriverError> {
        let missing_name =
            || DriverError::Validation("[name] field of collection is not configured".to_string());

        match value {
            Value::String(name) if name.is_empty() => Err(missing_name()),
            Value::String(name) => Ok(Self::named(name.clone())),
            Value::Object(def) => {
                let name = string_field(def, "name");
                if name.is_empty() {
                    return Err(missing_name());
                }
                let mut collection_type = string_field(def, "type");
                if collection_type.is_empty() {
                    collection_type = name.clone();
                }
                let parameters = match def.get("parameters") {
                    Some(Value::Object(params)) => params.clone(),
                    _ => Map::new(),
                };
                Ok(Self {
                    table_name: string_field(def, "table_name"),
                    name,
                    collection_type,
                    parameters,
                })
            }
            _ => Err(DriverError::Validation(COLLECTIONS_SHAPE_ERROR.to_string())),
        }
    }
}

/// Source declaration after normalization, before any driver is built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedSource {
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: String,
    pub destinations: Vec<String>,
    pub collections: Vec<Collection>,
}

impl SourceConfig {
    /// Resolved source type: the configured one, or the source name.
    pub fn resolved_type<'a>(&'a self, name: &'a str) -> &'a str {
        if self.source_type.is_empty() {
            name
        } else {
            &self.source_type
        }
    }

    /// Normalize collections and check the structural invariants:
    /// every collection is named and unique, and there is at least one
    /// collection and one destination.
    pub fn normalize(&self, name: &str) -> Result<NormalizedSource, DriverError> {
        let collections = self
            .collections
            .iter()
            .map(Collection::from_value)
            .collect::<Result<Vec<_>, _>>()?;

        if collections.is_empty() {
            return Err(DriverError::Validation(
                "collections are empty. Please specify at least one collection".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::with_capacity(collections.len());
        if let Some(dup) = collections.iter().find(|c| !seen.insert(c.name.as_str())) {
            return Err(DriverError::Validation(format!(
                "collection [{}] is configured more than once",
                dup.name
            )));
        }
        if self.destinations.is_empty() {
            return Err(DriverError::Validation(
                "destinations are empty. Please specify at least one destination".to_string(),
            ));
        }

        Ok(NormalizedSource {
            name: name.to_string(),
            source_type: self.resolved_type(name).to_string(),
            destinations: self.destinations.clone(),
            collections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source(collections: Value, destinations: Value) -> SourceConfig {
        serde_json::from_value(json!({
            "type": "crm",
            "destinations": destinations,
            "collections": collections,
        }))
        .unwrap()
    }

    #[test]
    fn bare_name_collection_uses_name_as_type() {
        let c = Collection::from_value(&json!("contacts")).unwrap();
        assert_eq!(c.name, "contacts");
        assert_eq!(c.collection_type, "contacts");
        assert!(c.table_name.is_empty());
    }

    #[test]
    fn structured_collection_keeps_overrides() {
        let c = Collection::from_value(&json!({
            "name": "deals",
            "type": "opportunities",
            "table_name": "crm_deals",
            "parameters": {"since": "2024-01-01"}
        }))
        .unwrap();
        assert_eq!(c.name, "deals");
        assert_eq!(c.collection_type, "opportunities");
        assert_eq!(c.table_name, "crm_deals");
        assert_eq!(c.parameters["since"], "2024-01-01");
    }

    #[test]
    fn structured_collection_without_type_defaults_to_name() {
        let c = Collection::from_value(&json!({"name": "deals"})).unwrap();
        assert_eq!(c.collection_type, "deals");
    }

    #[test]
    fn structured_collection_without_name_is_rejected() {
        let err = Collection::from_value(&json!({"table_name": "x"})).unwrap_err();
        assert!(matches!(err, DriverError::Validation(_)));
        assert!(err.to_string().contains("[name]"));
    }

    #[test]
    fn non_string_non_object_collection_is_rejected() {
        let err = Collection::from_value(&json!(42)).unwrap_err();
        assert!(matches!(err, DriverError::Validation(_)));
    }

    #[test]
    fn array_collection_entry_is_rejected() {
        let err = Collection::from_value(&json!(["deals", "opportunities"])).unwrap_err();
        assert!(
            err.to_string()
                .contains("array of string or collections structure")
        );

        let err = source(json!(["contacts", ["deals"]]), json!(["warehouse"]))
            .normalize("crm")
            .unwrap_err();
        assert!(matches!(err, DriverError::Validation(_)));
    }

    #[test]
    fn null_parameters_read_as_empty() {
        let c = Collection::from_value(&json!({"name": "deals", "parameters": null})).unwrap();
        assert_eq!(c.name, "deals");
        assert!(c.parameters.is_empty());

        let c = Collection::from_value(&json!({"name": "deals", "parameters": "none"})).unwrap();
        assert!(c.parameters.is_empty());
    }

    #[test]
    fn non_string_type_and_table_fall_back_to_defaults() {
        let c = Collection::from_value(&json!({
            "name": "deals",
            "type": 7,
            "table_name": {"schema": "crm"}
        }))
        .unwrap();
        assert_eq!(c.collection_type, "deals");
        assert!(c.table_name.is_empty());
    }

    #[test]
    fn non_string_name_is_missing() {
        let err = Collection::from_value(&json!({"name": 12})).unwrap_err();
        assert!(err.to_string().contains("[name]"));
    }

    #[test]
    fn normalize_requires_collections_and_destinations() {
        let err = source(json!([]), json!(["warehouse"]))
            .normalize("crm")
            .unwrap_err();
        assert!(err.to_string().contains("collections are empty"));

        let err = source(json!(["contacts"]), json!([]))
            .normalize("crm")
            .unwrap_err();
        assert!(err.to_string().contains("destinations are empty"));
    }

    #[test]
    fn duplicate_collection_names_are_rejected() {
        let err = source(json!(["contacts", {"name": "contacts", "table_name": "c2"}]), json!(["warehouse"]))
            .normalize("crm")
            .unwrap_err();
        assert!(err.to_string().contains("[contacts] is configured more than once"));
    }

    #[test]
    fn empty_type_resolves_to_source_name() {
        let cfg: SourceConfig = serde_json::from_value(json!({
            "destinations": ["warehouse"],
            "collections": ["contacts"]
        }))
        .unwrap();
        let normalized = cfg.normalize("hubspot").unwrap();
        assert_eq!(normalized.source_type, "hubspot");
    }

    #[test]
    fn source_config_decodes_from_toml() {
        let cfg: SourceConfig = toml::from_str(
            r#"
            type = "crm"
            destinations = ["warehouse"]
            collections = ["contacts", { name = "deals", table_name = "crm_deals" }]
            "#,
        )
        .unwrap();
        let normalized = cfg.normalize("crm").unwrap();
        assert_eq!(normalized.collections.len(), 2);
        assert_eq!(normalized.collections[1].table_name, "crm_deals");
    }
}
