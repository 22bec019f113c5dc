use async_trait::async_trait;
use extshell_core::{
    EventBus, EventKind, ExtensionDescriptor, LoadError, LoadState, Loader, LoaderConfig,
    ManifestEntry, ModuleFetcher, Registry, RegistryConfig,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Records every fetch; tags listed in `failures` fail that many times.
#[derive(Default)]
struct RecordingFetcher {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, usize>>,
}

impl RecordingFetcher {
    fn failing(tags: &[(&str, usize)]) -> Self {
        let fetcher = Self::default();
        {
            let mut failures = fetcher.failures.lock().unwrap();
            for (tag, times) in tags {
                failures.insert(tag.to_string(), *times);
            }
        }
        fetcher
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModuleFetcher for RecordingFetcher {
    async fn fetch_module(&self, descriptor: &ExtensionDescriptor) -> Result<(), String> {
        tokio::task::yield_now().await;
        self.calls.lock().unwrap().push(descriptor.tag.clone());
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&descriptor.tag) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(format!("cannot import {}", descriptor.path))
            }
            _ => Ok(()),
        }
    }
}

fn unit(tag: &str, deps: &[&str]) -> ManifestEntry {
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

fn setup(manifest: &[ManifestEntry], fetcher: Arc<RecordingFetcher>) -> Loader {
    setup_with(manifest, fetcher, LoaderConfig::default())
}

fn setup_with(
    manifest: &[ManifestEntry],
    fetcher: Arc<RecordingFetcher>,
    config: LoaderConfig,
) -> Loader {
    let registry = Arc::new(Registry::in_memory(
        RegistryConfig::default(),
        EventBus::default(),
    ));
    registry.sync(manifest).expect("manifest should sync");
    Loader::new(registry, fetcher, &config)
}

#[tokio::test]
async fn loads_dependencies_first_and_emits_lifecycle_events() {
    let fetcher = Arc::new(RecordingFetcher::default());
    let loader = setup(&[unit("a", &[]), unit("b", &["a"])], fetcher.clone());
    let mut events = loader.subscribe();

    let outcome = loader.load("b").await.expect("b should load");

    assert_eq!(outcome.order, vec!["a".to_string(), "b".to_string()]);
    assert!(!outcome.cached);
    assert_eq!(loader.state("a"), Some(LoadState::Loaded));
    assert_eq!(loader.state("b"), Some(LoadState::Loaded));
    assert_eq!(fetcher.calls(), vec!["a".to_string(), "b".to_string()]);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push((event.kind, event.subject));
    }
    assert_eq!(
        seen,
        vec![
            (EventKind::Loading, "a".to_string()),
            (EventKind::Loaded, "a".to_string()),
            (EventKind::Loading, "b".to_string()),
            (EventKind::Loaded, "b".to_string()),
        ]
    );
}

#[tokio::test]
async fn concurrent_loads_share_one_fetch() {
    let fetcher = Arc::new(RecordingFetcher::default());
    let loader = setup(
        &[unit("shared", &[]), unit("left", &["shared"]), unit("right", &["shared"])],
        fetcher.clone(),
    );

    let (first, second, left, right) = tokio::join!(
        loader.load("shared"),
        loader.load("shared"),
        loader.load("left"),
        loader.load("right")
    );
    first.expect("first load");
    second.expect("second load");
    left.expect("left load");
    right.expect("right load");

    let calls = fetcher.calls();
    assert_eq!(calls.iter().filter(|tag| *tag == "shared").count(), 1);
    assert_eq!(calls.len(), 3);
    assert_eq!(loader.in_flight(), 0);
}

#[tokio::test]
async fn loaded_unit_takes_cached_path() {
    let fetcher = Arc::new(RecordingFetcher::default());
    let loader = setup(&[unit("a", &[])], fetcher.clone());

    loader.load("a").await.expect("first load");
    let outcome = loader.load("a").await.expect("second load");

    assert!(outcome.cached);
    assert_eq!(outcome.order, vec!["a".to_string()]);
    assert_eq!(fetcher.calls().len(), 1);
}

#[tokio::test]
async fn removed_unit_is_not_served_from_cache() {
    let fetcher = Arc::new(RecordingFetcher::default());
    let loader = setup(&[unit("a", &[])], fetcher.clone());
    loader.load("a").await.expect("first load");

    loader.registry().sync(&[]).expect("a dropped from manifest");
    let entry = loader.registry().get("a").expect("entry is kept");
    assert!(entry.removed);
    assert_eq!(entry.load_state, LoadState::Loaded);

    assert_eq!(
        loader.load("a").await.unwrap_err(),
        LoadError::NotFound("a".to_string())
    );
    assert_eq!(fetcher.calls().len(), 1);
}

#[tokio::test]
async fn disabled_unit_is_not_served_from_cache() {
    let fetcher = Arc::new(RecordingFetcher::default());
    let loader = setup(&[unit("a", &[])], fetcher.clone());
    loader.load("a").await.expect("first load");

    loader
        .registry()
        .set_enabled("a", false)
        .expect("disable a");
    assert_eq!(
        loader.load("a").await.unwrap_err(),
        LoadError::Disabled("a".to_string())
    );

    loader
        .registry()
        .set_enabled("a", true)
        .expect("enable a");
    let outcome = loader.load("a").await.expect("re-enabled unit");
    assert!(outcome.cached);
    assert_eq!(fetcher.calls().len(), 1);
}

#[tokio::test]
async fn resolution_failures_reject_before_any_fetch() {
    let fetcher = Arc::new(RecordingFetcher::default());
    let loader = setup(
        &[
            unit("a", &["b"]),
            unit("b", &["a"]),
            unit("lonely", &["ghost"]),
        ],
        fetcher.clone(),
    );

    match loader.load("a").await {
        Err(LoadError::Cycle(path)) => {
            assert!(path.contains(&"a".to_string()));
            assert!(path.contains(&"b".to_string()));
        }
        other => panic!("expected cycle, got {other:?}"),
    }
    assert_eq!(
        loader.load("lonely").await.unwrap_err(),
        LoadError::MissingDependency {
            tag: "lonely".to_string(),
            missing: "ghost".to_string()
        }
    );
    assert_eq!(
        loader.load("nobody").await.unwrap_err(),
        LoadError::NotFound("nobody".to_string())
    );

    assert!(fetcher.calls().is_empty());
    assert_eq!(loader.state("a"), Some(LoadState::Registered));
}

#[tokio::test]
async fn pre_fetch_gate_rejects_incompatible_and_disabled_units() {
    let fetcher = Arc::new(RecordingFetcher::default());
    let mut future = unit("future", &[]);
    future.min_framework_version = Some("9.0.0".to_string());
    let loader = setup_with(
        &[unit("base", &[]), future, unit("app", &["base"])],
        fetcher.clone(),
        LoaderConfig {
            framework_version: "1.4.0".to_string(),
            ..LoaderConfig::default()
        },
    );

    let err = loader.load("future").await.unwrap_err();
    assert_eq!(
        err,
        LoadError::VersionIncompatible {
            tag: "future".to_string(),
            required: "9.0.0".to_string(),
            running: "1.4.0".to_string()
        }
    );
    assert!(err.is_pre_fetch());

    loader
        .registry()
        .set_enabled("base", false)
        .expect("disable base");
    assert_eq!(
        loader.load("app").await.unwrap_err(),
        LoadError::Disabled("base".to_string())
    );
    assert!(fetcher.calls().is_empty());
}

#[tokio::test]
async fn framework_gate_uses_semver_precedence() {
    let mut candidate = unit("candidate", &[]);
    candidate.version = "1.0.0-beta.1".to_string();
    candidate.min_framework_version = Some("2.0.0-rc.1".to_string());
    let mut release = unit("release", &[]);
    release.min_framework_version = Some("2.0.0".to_string());
    let manifest = [candidate, release];

    let stable = setup_with(
        &manifest,
        Arc::new(RecordingFetcher::default()),
        LoaderConfig {
            framework_version: "2.0.0".to_string(),
            ..LoaderConfig::default()
        },
    );
    stable.load("candidate").await.expect("2.0.0 satisfies 2.0.0-rc.1");
    stable.load("release").await.expect("2.0.0 satisfies 2.0.0");

    let preview = setup_with(
        &manifest,
        Arc::new(RecordingFetcher::default()),
        LoaderConfig {
            framework_version: "2.0.0-rc.2".to_string(),
            ..LoaderConfig::default()
        },
    );
    assert_eq!(preview.framework_version().to_string(), "2.0.0-rc.2");
    preview
        .load("candidate")
        .await
        .expect("rc.2 satisfies rc.1");
    assert_eq!(
        preview.load("release").await.unwrap_err(),
        LoadError::VersionIncompatible {
            tag: "release".to_string(),
            required: "2.0.0".to_string(),
            running: "2.0.0-rc.2".to_string()
        }
    );

    let older = setup_with(
        &manifest,
        Arc::new(RecordingFetcher::default()),
        LoaderConfig {
            framework_version: "1.9.0".to_string(),
            ..LoaderConfig::default()
        },
    );
    assert!(matches!(
        older.load("candidate").await,
        Err(LoadError::VersionIncompatible { .. })
    ));
}

#[tokio::test]
async fn failed_dependency_skips_only_its_dependents() {
    let fetcher = Arc::new(RecordingFetcher::failing(&[("base", 1)]));
    let loader = setup(
        &[
            unit("base", &[]),
            unit("mid", &["base"]),
            unit("side", &[]),
            unit("top", &["mid", "side"]),
        ],
        fetcher.clone(),
    );

    let err = loader.load("top").await.unwrap_err();
    match &err {
        LoadError::DependencyFailed {
            tag,
            dependency,
            source,
        } => {
            assert_eq!(tag, "top");
            assert_eq!(dependency, "mid");
            assert!(matches!(
                source.as_ref(),
                LoadError::DependencyFailed { dependency, .. } if dependency == "base"
            ));
        }
        other => panic!("expected dependency failure, got {other:?}"),
    }

    assert_eq!(fetcher.calls(), vec!["base".to_string(), "side".to_string()]);
    assert_eq!(loader.state("base"), Some(LoadState::Failed));
    assert_eq!(loader.state("mid"), Some(LoadState::Registered));
    assert_eq!(loader.state("side"), Some(LoadState::Loaded));
    assert_eq!(loader.state("top"), Some(LoadState::Registered));
    let base = loader.registry().get("base").expect("base entry");
    assert_eq!(base.last_error.as_deref(), Some("cannot import units/base.js"));
}

#[tokio::test]
async fn failed_unit_is_reattempted_on_next_load() {
    let fetcher = Arc::new(RecordingFetcher::failing(&[("flaky", 1)]));
    let loader = setup(&[unit("flaky", &[])], fetcher.clone());
    let mut events = loader.subscribe();

    let err = loader.load("flaky").await.unwrap_err();
    assert!(matches!(err, LoadError::ModuleFetch { .. }));
    assert_eq!(loader.state("flaky"), Some(LoadState::Failed));

    loader.load("flaky").await.expect("second attempt succeeds");
    assert_eq!(loader.state("flaky"), Some(LoadState::Loaded));
    assert_eq!(fetcher.calls().len(), 2);

    let kinds: Vec<EventKind> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|event| event.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Loading,
            EventKind::Failed,
            EventKind::Loading,
            EventKind::Loaded
        ]
    );
}

#[tokio::test]
async fn load_all_starts_by_priority_and_reports_every_tag() {
    let fetcher = Arc::new(RecordingFetcher::failing(&[("broken", 1)]));
    let mut low = unit("low", &[]);
    low.priority = 0;
    let mut high = unit("high", &[]);
    high.priority = 10;
    let mut mid = unit("mid", &[]);
    mid.priority = 5;
    let loader = setup_with(
        &[low, high, mid, unit("broken", &[])],
        fetcher.clone(),
        LoaderConfig {
            max_concurrency: 1,
            ..LoaderConfig::default()
        },
    );

    let results = loader
        .load_all(["low", "high", "mid", "broken", "ghost", "high"])
        .await;

    assert_eq!(results.len(), 5);
    assert!(results["low"].is_ok());
    assert!(results["high"].is_ok());
    assert!(results["mid"].is_ok());
    assert!(matches!(results["broken"], Err(LoadError::ModuleFetch { .. })));
    assert_eq!(
        results["ghost"],
        Err(LoadError::NotFound("ghost".to_string()))
    );
    assert_eq!(
        fetcher.calls(),
        vec![
            "high".to_string(),
            "mid".to_string(),
            "low".to_string(),
            "broken".to_string()
        ]
    );
}
