//! Work descriptors as persisted by the job planner.
//!
//! A work unit is the smallest schedulable item. A bundle groups units (and
//! other bundles) so that several of them travel to one worker together.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// String key/value configuration, as carried by units, bundles and jobs.
pub type Properties = BTreeMap<String, String>;

/// File extension marking a persisted bundle.
pub const BUNDLE_FILE_EXTENSION: &str = ".mwu";

/// File extension marking a persisted single unit.
pub const UNIT_FILE_EXTENSION: &str = ".wu";

/// Property naming the task id a unit runs under.
pub const TASK_ID_KEY: &str = "task.id";

// ---------------------------------------------------------------------------
// Work Unit
// ---------------------------------------------------------------------------

/// A leaf descriptor of one unit of work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    #[serde(default)]
    pub properties: Properties,
}

impl WorkUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Set `key` only if the unit does not define it already.
    pub fn set_default(&mut self, key: &str, value: &str) {
        if !self.properties.contains_key(key) {
            self.properties.insert(key.to_string(), value.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Work Bundle
// ---------------------------------------------------------------------------

/// An ordered grouping of units and nested bundles.
///
/// Bundle-level properties act as defaults for everything nested inside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkBundle {
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub units: Vec<WorkDescriptor>,
}

impl WorkBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn unit(mut self, unit: WorkUnit) -> Self {
        self.units.push(WorkDescriptor::Unit(unit));
        self
    }

    pub fn bundle(mut self, bundle: WorkBundle) -> Self {
        self.units.push(WorkDescriptor::Bundle(bundle));
        self
    }

    /// Number of leaf units, at any depth.
    pub fn leaf_count(&self) -> usize {
        self.units.iter().map(WorkDescriptor::leaf_count).sum()
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Either a single unit or a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkDescriptor {
    Unit(WorkUnit),
    Bundle(WorkBundle),
}

impl WorkDescriptor {
    pub fn leaf_count(&self) -> usize {
        match self {
            WorkDescriptor::Unit(_) => 1,
            WorkDescriptor::Bundle(b) => b.leaf_count(),
        }
    }

    pub fn is_bundle(&self) -> bool {
        matches!(self, WorkDescriptor::Bundle(_))
    }
}

impl From<WorkUnit> for WorkDescriptor {
    fn from(unit: WorkUnit) -> Self {
        WorkDescriptor::Unit(unit)
    }
}

impl From<WorkBundle> for WorkDescriptor {
    fn from(bundle: WorkBundle) -> Self {
        WorkDescriptor::Bundle(bundle)
    }
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// Where a descriptor lives in the store: the parent directory names the
/// logical store, the last path segment is the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorLocation {
    pub store_name: String,
    pub file_name: String,
}

impl DescriptorLocation {
    /// Split a path such as `/apps/wu/job_x_1/task_0.mwu` into
    /// store `job_x_1` and file `task_0.mwu`.
    pub fn parse(path: &str) -> crate::error::Result<Self> {
        let mut segments = path.trim_end_matches('/').rsplit('/');
        let file_name = segments.next().filter(|s| !s.is_empty());
        let store_name = segments.next().filter(|s| !s.is_empty());
        match (store_name, file_name) {
            (Some(store), Some(file)) => Ok(Self {
                store_name: store.to_string(),
                file_name: file.to_string(),
            }),
            _ => Err(crate::error::Error::Config(format!(
                "work unit path {path:?} needs a store directory and a file name"
            ))),
        }
    }

    pub fn is_bundle(&self) -> bool {
        self.file_name.ends_with(BUNDLE_FILE_EXTENSION)
    }
}

impl std::fmt::Display for DescriptorLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.store_name, self.file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_splits_store_and_file() {
        let loc = DescriptorLocation::parse("/apps/_workunits/job_etl_42/task_0.mwu").unwrap();
        assert_eq!(loc.store_name, "job_etl_42");
        assert_eq!(loc.file_name, "task_0.mwu");
        assert!(loc.is_bundle());
    }

    #[test]
    fn location_without_parent_is_rejected() {
        assert!(DescriptorLocation::parse("task_0.wu").is_err());
        assert!(DescriptorLocation::parse("").is_err());
    }

    #[test]
    fn unit_extension_is_not_a_bundle() {
        let loc = DescriptorLocation::parse("store/task_3.wu").unwrap();
        assert!(!loc.is_bundle());
    }

    #[test]
    fn descriptor_json_is_tagged() {
        let bundle = WorkBundle::new().unit(WorkUnit::new().with_property("a", "1"));
        let json = serde_json::to_value(WorkDescriptor::from(bundle)).unwrap();
        assert_eq!(json["kind"], "bundle");
        assert_eq!(json["units"][0]["kind"], "unit");
        assert_eq!(json["units"][0]["properties"]["a"], "1");
    }
}
