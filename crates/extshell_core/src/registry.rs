//! Extension registry: in-memory mirror over a durable key-value store.
//!
//! # Responsibility
//! - Reconcile manifest declarations into persisted registry entries.
//! - Serve descriptor reads and load-state bookkeeping from memory.
//!
//! # Invariants
//! - `tag` is unique; entries are keyed by their trimmed tag.
//! - Reconciliation never rewrites the user-owned `enabled` flag.
//! - `internal` entries are never removed by reconciliation.
//! - Storage failures are logged and absorbed: the registry switches to
//!   memory-only mode instead of propagating them.

use crate::config::{RegistryConfig, RemovalPolicy};
use crate::events::{now_epoch_ms, EventBus, EventKind};
use crate::extension::descriptor::{ExtensionDescriptor, LoadState, RegistryEntry};
use crate::extension::manifest::{validate_manifest, ManifestEntry, ManifestValidationError};
use crate::storage::{KeyValueStore, SqliteStore, StorageError, StorageResult};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Persisted form of one entry. Load state is deliberately absent.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    descriptor: ExtensionDescriptor,
    #[serde(default)]
    removed: bool,
}

/// Tags touched by one `sync` call, in manifest (or tag) order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

struct RegistryState {
    entries: BTreeMap<String, RegistryEntry>,
    store: Option<Box<dyn KeyValueStore>>,
}

/// Registry of extension descriptors and their load state.
pub struct Registry {
    state: Mutex<RegistryState>,
    config: RegistryConfig,
    events: EventBus,
}

impl Registry {
    /// Creates a memory-only registry.
    pub fn in_memory(config: RegistryConfig, events: EventBus) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                entries: BTreeMap::new(),
                store: None,
            }),
            config,
            events,
        }
    }

    /// Creates a registry restored from `store`.
    ///
    /// An unreadable store degrades the registry to memory-only mode;
    /// undecodable rows are skipped individually.
    pub fn with_store(
        store: Box<dyn KeyValueStore>,
        config: RegistryConfig,
        events: EventBus,
    ) -> Self {
        let registry = Self::in_memory(config, events);
        match restore_entries(store.as_ref()) {
            Ok(entries) => {
                info!(
                    "event=registry_restore module=registry status=ok entries={}",
                    entries.len()
                );
                let mut state = registry.lock();
                state.entries = entries;
                state.store = Some(store);
            }
            Err(err) => {
                warn!(
                    "event=registry_restore module=registry status=degraded error_code=storage_unavailable error={err}"
                );
            }
        }
        registry
    }

    /// Opens a SQLite-backed registry, falling back to memory-only mode when
    /// the database cannot be opened.
    pub fn open_sqlite(path: impl AsRef<Path>, config: RegistryConfig, events: EventBus) -> Self {
        match SqliteStore::open(path) {
            Ok(store) => Self::with_store(Box::new(store), config, events),
            Err(err) => {
                warn!(
                    "event=registry_open module=registry status=degraded error_code=storage_unavailable error={err}"
                );
                Self::in_memory(config, events)
            }
        }
    }

    /// Returns whether writes still reach durable storage.
    pub fn is_persistent(&self) -> bool {
        self.lock().store.is_some()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Reconciles `manifest` into the registry.
    ///
    /// The manifest is validated as a whole first; an invalid manifest leaves
    /// the registry untouched.
    pub fn sync(&self, manifest: &[ManifestEntry]) -> RegistryResult<SyncReport> {
        validate_manifest(manifest).map_err(RegistryError::InvalidManifest)?;

        let mut report = SyncReport::default();
        let mut state = self.lock();
        let manifest_tags: BTreeSet<&str> = manifest.iter().map(|entry| entry.tag.trim()).collect();

        for entry in manifest {
            let tag = entry.tag.trim();
            let updated = match state.entries.get_mut(tag) {
                None => {
                    let registered = RegistryEntry::new(ExtensionDescriptor::from_manifest(entry));
                    state.entries.insert(tag.to_string(), registered);
                    report.added.push(tag.to_string());
                    true
                }
                Some(existing) => {
                    let changed = existing.descriptor.differs_from(entry) || existing.removed;
                    let metadata_changed = existing.descriptor.priority != entry.priority
                        || existing.descriptor.internal != entry.internal;
                    if changed || metadata_changed {
                        existing.descriptor.apply_manifest(entry);
                        existing.removed = false;
                    }
                    if changed {
                        report.updated.push(tag.to_string());
                    }
                    changed || metadata_changed
                }
            };
            if updated {
                persist_entry(&mut state, tag);
            }
        }

        let stale: Vec<String> = state
            .entries
            .values()
            .filter(|existing| {
                !manifest_tags.contains(existing.tag())
                    && !existing.descriptor.internal
                    && (!existing.removed || self.config.removal_policy == RemovalPolicy::Delete)
            })
            .map(|existing| existing.tag().to_string())
            .collect();

        for tag in stale {
            match self.config.removal_policy {
                RemovalPolicy::MarkAndKeep => {
                    if let Some(existing) = state.entries.get_mut(&tag) {
                        existing.removed = true;
                    }
                    persist_entry(&mut state, &tag);
                }
                RemovalPolicy::Delete => {
                    state.entries.remove(&tag);
                    unpersist_entry(&mut state, &tag);
                }
            }
            report.removed.push(tag);
        }

        let persistent = state.store.is_some();
        drop(state);

        info!(
            "event=registry_sync module=registry status=ok added={} updated={} removed={} persistent={}",
            report.added.len(),
            report.updated.len(),
            report.removed.len(),
            persistent
        );
        for tag in &report.added {
            self.events.emit(EventKind::Registered, tag, None);
        }
        for tag in &report.updated {
            self.events.emit(EventKind::Updated, tag, None);
        }
        for tag in &report.removed {
            let detail = match self.config.removal_policy {
                RemovalPolicy::MarkAndKeep => "marked",
                RemovalPolicy::Delete => "deleted",
            };
            self.events
                .emit(EventKind::Removed, tag, Some(detail.to_string()));
        }
        Ok(report)
    }

    pub fn get(&self, tag: &str) -> Option<RegistryEntry> {
        self.lock().entries.get(tag.trim()).cloned()
    }

    /// Returns every entry, including removed ones, ordered by tag.
    pub fn list(&self) -> Vec<RegistryEntry> {
        self.lock().entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Resolvable descriptors: every entry not marked removed.
    pub fn snapshot(&self) -> BTreeMap<String, ExtensionDescriptor> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, entry)| !entry.removed)
            .map(|(tag, entry)| (tag.clone(), entry.descriptor.clone()))
            .collect()
    }

    /// Records a user override of the `enabled` flag.
    pub fn set_enabled(&self, tag: &str, enabled: bool) -> RegistryResult<()> {
        let tag = tag.trim();
        let mut state = self.lock();
        let entry = state
            .entries
            .get_mut(tag)
            .ok_or_else(|| RegistryError::NotFound(tag.to_string()))?;
        if entry.descriptor.enabled == enabled {
            return Ok(());
        }
        entry.descriptor.enabled = enabled;
        persist_entry(&mut state, tag);
        info!("event=registry_set_enabled module=registry status=ok tag={tag} enabled={enabled}");
        Ok(())
    }

    /// Drops every non-internal entry from memory and storage.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let doomed: Vec<String> = state
            .entries
            .values()
            .filter(|entry| !entry.descriptor.internal)
            .map(|entry| entry.tag().to_string())
            .collect();
        for tag in &doomed {
            state.entries.remove(tag);
            unpersist_entry(&mut state, tag);
        }
        info!(
            "event=registry_clear module=registry status=ok removed={}",
            doomed.len()
        );
        doomed.len()
    }

    pub fn load_state(&self, tag: &str) -> Option<LoadState> {
        self.lock().entries.get(tag).map(|entry| entry.load_state)
    }

    /// Moves `tag` into `Loading`, returning the descriptor to fetch.
    pub(crate) fn begin_loading(&self, tag: &str) -> Option<ExtensionDescriptor> {
        let mut state = self.lock();
        let entry = state.entries.get_mut(tag)?;
        entry.load_state = LoadState::Loading;
        entry.last_error = None;
        Some(entry.descriptor.clone())
    }

    pub(crate) fn mark_loaded(&self, tag: &str) {
        if let Some(entry) = self.lock().entries.get_mut(tag) {
            entry.load_state = LoadState::Loaded;
            entry.loaded_at_ms = Some(now_epoch_ms());
            entry.last_error = None;
        }
    }

    pub(crate) fn mark_failed(&self, tag: &str, reason: &str) {
        if let Some(entry) = self.lock().entries.get_mut(tag) {
            entry.load_state = LoadState::Failed;
            entry.last_error = Some(reason.to_string());
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn restore_entries(
    store: &dyn KeyValueStore,
) -> StorageResult<BTreeMap<String, RegistryEntry>> {
    let mut entries = BTreeMap::new();
    for (key, value) in store.get_all()? {
        let stored: StoredEntry = match serde_json::from_str(&value) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(
                    "event=registry_restore module=registry status=skipped key={key} error_code=malformed_entry error={err}"
                );
                continue;
            }
        };
        let mut entry = RegistryEntry::new(stored.descriptor);
        entry.removed = stored.removed;
        entries.insert(entry.tag().to_string(), entry);
    }
    Ok(entries)
}

fn persist_entry(state: &mut RegistryState, tag: &str) {
    let Some(entry) = state.entries.get(tag) else {
        return;
    };
    let stored = StoredEntry {
        descriptor: entry.descriptor.clone(),
        removed: entry.removed,
    };
    let Some(store) = state.store.as_mut() else {
        return;
    };
    let result = serde_json::to_string(&stored)
        .map_err(StorageError::from)
        .and_then(|value| store.put(tag, &value));
    if let Err(err) = result {
        degrade(state, "put", tag, &err);
    }
}

fn unpersist_entry(state: &mut RegistryState, tag: &str) {
    let Some(store) = state.store.as_mut() else {
        return;
    };
    if let Err(err) = store.delete(tag) {
        degrade(state, "delete", tag, &err);
    }
}

fn degrade(state: &mut RegistryState, op: &str, tag: &str, err: &dyn Error) {
    warn!(
        "event=registry_persist module=registry status=degraded op={op} tag={tag} error_code=storage_unavailable error={err}"
    );
    state.store = None;
}

/// Registry operation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    InvalidManifest(ManifestValidationError),
    NotFound(String),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidManifest(err) => write!(f, "invalid extension manifest: {err}"),
            Self::NotFound(tag) => write!(f, "extension not registered: {tag}"),
        }
    }
}

impl Error for RegistryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidManifest(err) => Some(err),
            Self::NotFound(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Registry, RegistryError};
    use crate::config::RegistryConfig;
    use crate::events::EventBus;
    use crate::extension::descriptor::LoadState;
    use crate::extension::manifest::ManifestEntry;

    fn entry(tag: &str, deps: &[&str]) -> ManifestEntry {
        ManifestEntry {
            tag: tag.to_string(),
            path: format!("units/{tag}.js"),
            name: tag.to_string(),
            version: "1.0.0".to_string(),
            dependencies: deps.iter().map(|dep| dep.to_string()).collect(),
            priority: 0,
            internal: false,
            min_framework_version: None,
        }
    }

    fn registry() -> Registry {
        Registry::in_memory(RegistryConfig::default(), EventBus::default())
    }

    #[test]
    fn sync_is_idempotent_for_unchanged_manifest() {
        let registry = registry();
        let manifest = vec![entry("a", &[]), entry("b", &["a"])];

        let first = registry.sync(&manifest).unwrap();
        assert_eq!(first.added, vec!["a".to_string(), "b".to_string()]);

        let second = registry.sync(&manifest).unwrap();
        assert!(second.is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn invalid_manifest_leaves_registry_untouched() {
        let registry = registry();
        registry.sync(&[entry("a", &[])]).unwrap();

        let err = registry
            .sync(&[entry("b", &[]), entry("b", &[])])
            .expect_err("duplicate tag must be rejected");
        assert!(matches!(err, RegistryError::InvalidManifest(_)));
        assert!(registry.get("b").is_none());
        assert!(!registry.get("a").unwrap().removed);
    }

    #[test]
    fn priority_only_change_is_applied_silently() {
        let registry = registry();
        registry.sync(&[entry("a", &[])]).unwrap();

        let mut bumped = entry("a", &[]);
        bumped.priority = 7;
        let report = registry.sync(&[bumped]).unwrap();

        assert!(report.is_empty());
        assert_eq!(registry.get("a").unwrap().descriptor.priority, 7);
    }

    #[test]
    fn set_enabled_rejects_unknown_tag() {
        let registry = registry();
        let err = registry.set_enabled("ghost", false).unwrap_err();
        assert_eq!(err, RegistryError::NotFound("ghost".to_string()));
    }

    #[test]
    fn load_state_transitions_are_recorded() {
        let registry = registry();
        registry.sync(&[entry("a", &[])]).unwrap();

        let descriptor = registry.begin_loading("a").expect("registered entry");
        assert_eq!(descriptor.tag, "a");
        assert_eq!(registry.load_state("a"), Some(LoadState::Loading));

        registry.mark_failed("a", "boom");
        let failed = registry.get("a").unwrap();
        assert_eq!(failed.load_state, LoadState::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));

        registry.begin_loading("a");
        registry.mark_loaded("a");
        let loaded = registry.get("a").unwrap();
        assert_eq!(loaded.load_state, LoadState::Loaded);
        assert!(loaded.last_error.is_none());
        assert!(loaded.loaded_at_ms.is_some());
    }

    #[test]
    fn clear_keeps_internal_entries() {
        let registry = registry();
        let mut core = entry("core", &[]);
        core.internal = true;
        registry.sync(&[core, entry("a", &[])]).unwrap();

        assert_eq!(registry.clear(), 1);
        assert!(registry.get("core").is_some());
        assert!(registry.get("a").is_none());
    }
}
