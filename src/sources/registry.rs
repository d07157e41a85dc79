//! Versioned snapshot of the configured sources.
//!
//! Readers clone an `Arc` to the current snapshot under a brief shared lock and
//! then work without holding anything. A reload builds the next snapshot
//! completely before swapping it in, so a reload is observed either entirely
//! or not at all.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::drivers::{Driver, DriverPerCollection};

/// Registry entry of one source.
pub struct Unit {
    drivers: DriverPerCollection,
    destination_ids: Vec<String>,
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("collections", &self.collections())
            .field("destination_ids", &self.destination_ids)
            .finish()
    }
}

impl Unit {
    pub fn new(drivers: DriverPerCollection, destination_ids: Vec<String>) -> Self {
        Self {
            drivers,
            destination_ids,
        }
    }

    /// Collection names, sorted.
    pub fn collections(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn drivers(&self) -> impl Iterator<Item = (&str, &Arc<dyn Driver>)> {
        self.drivers.iter().map(|(name, driver)| (name.as_str(), driver))
    }

    pub fn driver(&self, collection: &str) -> Option<&Arc<dyn Driver>> {
        self.drivers.get(collection)
    }

    pub fn destination_ids(&self) -> &[String] {
        &self.destination_ids
    }
}

/// Immutable view of every registered source.
#[derive(Debug, Default)]
pub struct Snapshot {
    version: u64,
    units: HashMap<String, Arc<Unit>>,
}

impl Snapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<Unit>> {
        self.units.get(source_id).cloned()
    }

    pub fn source_ids(&self) -> BTreeSet<String> {
        self.units.keys().cloned().collect()
    }

    /// Source id -> sorted collection names.
    pub fn layout(&self) -> BTreeMap<String, Vec<String>> {
        self.units
            .iter()
            .map(|(id, unit)| {
                let collections = unit.collections().into_iter().map(String::from).collect();
                (id.clone(), collections)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SourceRegistry {
    current: RwLock<Arc<Snapshot>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<Unit>> {
        self.snapshot().get(source_id)
    }

    /// Replace every registered source at once; returns the new version.
    pub fn replace(&self, units: HashMap<String, Unit>) -> u64 {
        let units = units
            .into_iter()
            .map(|(id, unit)| (id, Arc::new(unit)))
            .collect();
        let mut current = self.current.write();
        let version = current.version + 1;
        *current = Arc::new(Snapshot { version, units });
        version
    }
}
