//! Extension loader.
//!
//! # Responsibility
//! - Turn `load(tag)` requests into ordered `fetch_module` calls.
//! - Drive per-unit `Registered -> Loading -> Loaded | Failed` transitions
//!   and publish matching lifecycle events.
//!
//! # Invariants
//! - Resolution and pre-fetch gate failures reject before any fetch starts.
//! - At most one fetch per tag is in flight; every concurrent request for the
//!   tag awaits the same shared future.
//! - Within one `load`, a dependency reaches `Loaded` before its dependent
//!   enters `Loading`.
//! - A failed unit only takes down units that depend on it.
//! - In-flight unit fetches run as spawned tasks, so they settle even when
//!   every waiter goes away.

mod error;
mod fetch;

pub use error::LoadError;
pub use fetch::ModuleFetcher;

use crate::config::LoaderConfig;
use crate::events::{EventBus, EventKind, ShellEvent};
use crate::extension::descriptor::{ExtensionDescriptor, LoadState};
use crate::extension::version::Version;
use crate::registry::Registry;
use crate::resolver::resolve_order;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::broadcast;

pub type LoadResult = Result<LoadOutcome, LoadError>;

type SharedUnit = Shared<BoxFuture<'static, Result<(), LoadError>>>;

/// Successful `load` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub tag: String,
    /// Resolved order for a fresh load; `[tag]` on the cached fast path.
    pub order: Vec<String>,
    /// `true` when the unit was already loaded and nothing was awaited.
    pub cached: bool,
}

/// Dependency-aware, deduplicating extension loader.
///
/// Cloning is cheap and all clones share one in-flight map.
#[derive(Clone)]
pub struct Loader {
    inner: Arc<LoaderInner>,
}

struct LoaderInner {
    registry: Arc<Registry>,
    fetcher: Arc<dyn ModuleFetcher>,
    events: EventBus,
    framework_version: Version,
    max_concurrency: usize,
    in_flight: Mutex<HashMap<String, SharedUnit>>,
}

impl Loader {
    /// Creates a loader publishing on the registry's event bus.
    pub fn new(
        registry: Arc<Registry>,
        fetcher: Arc<dyn ModuleFetcher>,
        config: &LoaderConfig,
    ) -> Self {
        let framework_version = Version::parse(&config.framework_version).unwrap_or_else(|| {
            warn!(
                "event=loader_init module=loader status=degraded error_code=invalid_framework_version value={}",
                config.framework_version
            );
            Version::current()
        });
        let events = registry.events().clone();
        Self {
            inner: Arc::new(LoaderInner {
                registry,
                fetcher,
                events,
                framework_version,
                max_concurrency: config.max_concurrency,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn framework_version(&self) -> &Version {
        &self.inner.framework_version
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShellEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self, tag: &str) -> Option<LoadState> {
        self.inner.registry.load_state(tag.trim())
    }

    /// Number of unit fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.lock_in_flight().len()
    }

    /// Loads `tag` and everything it depends on.
    ///
    /// Already loaded units are never fetched again; a unit left `Failed` by
    /// an earlier call is re-attempted. The cached shortcut only applies to
    /// entries that would still pass `plan`, so removed and disabled units
    /// are rejected even after a successful load.
    pub async fn load(&self, tag: &str) -> LoadResult {
        let tag = tag.trim();
        if self.inner.is_servable_from_cache(tag) {
            debug!("event=load module=loader status=cached tag={tag}");
            return Ok(LoadOutcome {
                tag: tag.to_string(),
                order: vec![tag.to_string()],
                cached: true,
            });
        }

        let started_at = Instant::now();
        let plan = match self.inner.plan(tag) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(
                    "event=load module=loader status=rejected tag={tag} error_code={} error={err}",
                    err.code()
                );
                return Err(err);
            }
        };

        let mut failures = HashMap::<String, LoadError>::new();
        for descriptor in &plan {
            let blocked_by = descriptor
                .dependencies
                .iter()
                .find_map(|dependency| failures.get(dependency).map(|err| (dependency, err)));
            if let Some((dependency, cause)) = blocked_by {
                debug!(
                    "event=load_unit module=loader status=skipped tag={} dependency={dependency}",
                    descriptor.tag
                );
                let skipped = LoadError::DependencyFailed {
                    tag: descriptor.tag.clone(),
                    dependency: dependency.clone(),
                    source: Box::new(cause.clone()),
                };
                failures.insert(descriptor.tag.clone(), skipped);
                continue;
            }

            if let Err(err) = self.inner.load_unit(&descriptor.tag).await {
                failures.insert(descriptor.tag.clone(), err);
            }
        }

        let order: Vec<String> = plan.into_iter().map(|descriptor| descriptor.tag).collect();
        match failures.remove(tag) {
            Some(err) => {
                warn!(
                    "event=load module=loader status=error tag={tag} duration_ms={} error_code={} error={err}",
                    started_at.elapsed().as_millis(),
                    err.code()
                );
                Err(err)
            }
            None => {
                info!(
                    "event=load module=loader status=ok tag={tag} units={} duration_ms={}",
                    order.len(),
                    started_at.elapsed().as_millis()
                );
                Ok(LoadOutcome {
                    tag: tag.to_string(),
                    order,
                    cached: false,
                })
            }
        }
    }

    /// Loads every tag as an independent chain.
    ///
    /// Chains start in descending priority order (input order for ties) and
    /// at most `max_concurrency` run at once. Always returns one result per
    /// distinct tag.
    pub async fn load_all<I, S>(&self, tags: I) -> BTreeMap<String, LoadResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut queue: Vec<(i32, usize, String)> = Vec::new();
        for (index, tag) in tags.into_iter().enumerate() {
            let tag = tag.into().trim().to_string();
            if queue.iter().any(|(_, _, queued)| *queued == tag) {
                continue;
            }
            let priority = self
                .inner
                .registry
                .get(&tag)
                .map_or(i32::MIN, |entry| entry.descriptor.priority);
            queue.push((priority, index, tag));
        }
        queue.sort_by(|left, right| right.0.cmp(&left.0).then(left.1.cmp(&right.1)));

        let limit = match self.inner.max_concurrency {
            0 => queue.len().max(1),
            limit => limit,
        };
        let results: BTreeMap<String, LoadResult> = stream::iter(queue)
            .map(|(_, _, tag)| async move {
                let result = self.load(&tag).await;
                (tag, result)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        let failed = results.values().filter(|result| result.is_err()).count();
        info!(
            "event=load_all module=loader status={} total={} failed={failed}",
            if failed == 0 { "ok" } else { "partial" },
            results.len()
        );
        results
    }
}

impl LoaderInner {
    fn is_servable_from_cache(&self, tag: &str) -> bool {
        self.registry.get(tag).is_some_and(|entry| {
            entry.load_state == LoadState::Loaded
                && !entry.removed
                && self.check_gate(&entry.descriptor).is_ok()
        })
    }

    /// Resolves `tag` and runs the pre-fetch gate over the whole order.
    fn plan(&self, tag: &str) -> Result<Vec<ExtensionDescriptor>, LoadError> {
        let snapshot = self.registry.snapshot();
        let order = resolve_order(&snapshot, tag)?;
        let mut plan = Vec::with_capacity(order.len());
        for unit in &order {
            let Some(descriptor) = snapshot.get(unit) else {
                return Err(LoadError::NotFound(unit.clone()));
            };
            self.check_gate(descriptor)?;
            plan.push(descriptor.clone());
        }
        Ok(plan)
    }

    fn check_gate(&self, descriptor: &ExtensionDescriptor) -> Result<(), LoadError> {
        if !descriptor.enabled {
            return Err(LoadError::Disabled(descriptor.tag.clone()));
        }
        if let Some(required) = &descriptor.min_framework_version {
            // Unparseable requirements never pass registry validation.
            let satisfied = Version::parse(required)
                .is_some_and(|required| self.framework_version.satisfies(&required));
            if !satisfied {
                return Err(LoadError::VersionIncompatible {
                    tag: descriptor.tag.clone(),
                    required: required.clone(),
                    running: self.framework_version.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Awaits the single in-flight fetch for `tag`, starting it if needed.
    async fn load_unit(self: &Arc<Self>, tag: &str) -> Result<(), LoadError> {
        let unit = {
            let mut in_flight = self.lock_in_flight();
            match in_flight.get(tag) {
                Some(existing) => existing.clone(),
                None => {
                    if self.registry.load_state(tag) == Some(LoadState::Loaded) {
                        return Ok(());
                    }
                    let Some(descriptor) = self.registry.begin_loading(tag) else {
                        return Err(LoadError::NotFound(tag.to_string()));
                    };
                    self.events.emit(EventKind::Loading, tag, None);
                    let unit = Arc::clone(self).spawn_fetch(descriptor);
                    in_flight.insert(tag.to_string(), unit.clone());
                    unit
                }
            }
        };
        unit.await
    }

    fn spawn_fetch(self: Arc<Self>, descriptor: ExtensionDescriptor) -> SharedUnit {
        let tag = descriptor.tag.clone();
        let task = tokio::spawn(Arc::clone(&self).fetch_unit(descriptor));
        async move {
            match task.await {
                Ok(result) => result,
                Err(join_err) => {
                    let reason = format!("fetch task aborted: {join_err}");
                    self.settle_failure(&tag, &reason);
                    Err(LoadError::ModuleFetch { tag, reason })
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn fetch_unit(self: Arc<Self>, descriptor: ExtensionDescriptor) -> Result<(), LoadError> {
        let started_at = Instant::now();
        let tag = descriptor.tag.clone();
        match self.fetcher.fetch_module(&descriptor).await {
            Ok(()) => {
                self.registry.mark_loaded(&tag);
                self.lock_in_flight().remove(&tag);
                info!(
                    "event=load_unit module=loader status=ok tag={tag} version={} duration_ms={}",
                    descriptor.version,
                    started_at.elapsed().as_millis()
                );
                self.events.emit(EventKind::Loaded, &tag, None);
                Ok(())
            }
            Err(reason) => {
                warn!(
                    "event=load_unit module=loader status=error tag={tag} duration_ms={} error_code=module_fetch_failed error={reason}",
                    started_at.elapsed().as_millis()
                );
                self.settle_failure(&tag, &reason);
                Err(LoadError::ModuleFetch { tag, reason })
            }
        }
    }

    fn settle_failure(&self, tag: &str, reason: &str) {
        self.registry.mark_failed(tag, reason);
        self.lock_in_flight().remove(tag);
        self.events
            .emit(EventKind::Failed, tag, Some(reason.to_string()));
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, SharedUnit>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
