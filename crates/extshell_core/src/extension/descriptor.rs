//! Extension descriptor and registry entry model.
//!
//! # Invariants
//! - `tag` never changes after the first reconciliation.
//! - `enabled` is user-owned: manifest reconciliation never rewrites it.
//! - Load state is runtime-only; persisted entries always restore as
//!   `LoadState::Registered`.

use crate::extension::manifest::ManifestEntry;
use serde::{Deserialize, Serialize};

/// Declarative record describing one loadable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionDescriptor {
    pub tag: String,
    pub path: String,
    pub name: String,
    pub version: String,
    /// Ordered dependency tags; declaration order breaks resolution ties.
    pub dependencies: Vec<String>,
    /// Higher values start first when `load_all` has to queue.
    pub priority: i32,
    /// Internal units are never removed by reconciliation.
    pub internal: bool,
    pub enabled: bool,
    pub min_framework_version: Option<String>,
}

impl ExtensionDescriptor {
    /// Builds a freshly registered descriptor; new units start enabled.
    pub fn from_manifest(entry: &ManifestEntry) -> Self {
        Self {
            tag: entry.tag.trim().to_string(),
            path: entry.path.clone(),
            name: entry.name.clone(),
            version: entry.version.trim().to_string(),
            dependencies: entry.dependencies.clone(),
            priority: entry.priority,
            internal: entry.internal,
            enabled: true,
            min_framework_version: entry.min_framework_version.clone(),
        }
    }

    /// Returns whether any reconciled field differs from the manifest.
    ///
    /// `priority` and `internal` are scheduling metadata and are not compared.
    pub fn differs_from(&self, entry: &ManifestEntry) -> bool {
        self.path != entry.path
            || self.name != entry.name
            || self.version != entry.version.trim()
            || self.dependencies != entry.dependencies
            || self.min_framework_version != entry.min_framework_version
    }

    /// Copies manifest-owned fields, keeping the user-owned `enabled` flag.
    pub fn apply_manifest(&mut self, entry: &ManifestEntry) {
        self.path = entry.path.clone();
        self.name = entry.name.clone();
        self.version = entry.version.trim().to_string();
        self.dependencies = entry.dependencies.clone();
        self.priority = entry.priority;
        self.internal = entry.internal;
        self.min_framework_version = entry.min_framework_version.clone();
    }
}

/// Per-unit load state machine: `Registered -> Loading -> Loaded | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Registered,
    Loading,
    Loaded,
    Failed,
}

impl LoadState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Failed => "failed",
        }
    }
}

/// Descriptor plus runtime load bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub descriptor: ExtensionDescriptor,
    pub load_state: LoadState,
    pub last_error: Option<String>,
    pub loaded_at_ms: Option<i64>,
    /// Set by the mark-and-keep removal policy; removed entries never resolve.
    pub removed: bool,
}

impl RegistryEntry {
    pub fn new(descriptor: ExtensionDescriptor) -> Self {
        Self {
            descriptor,
            load_state: LoadState::Registered,
            last_error: None,
            loaded_at_ms: None,
            removed: false,
        }
    }

    pub fn tag(&self) -> &str {
        &self.descriptor.tag
    }
}
