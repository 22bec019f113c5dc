//! Core logic for the extension shell.
//! Registry, dependency resolution, loading and asset caching live here;
//! frontends only wire them together.

pub mod cache;
pub mod config;
pub mod db;
pub mod events;
pub mod extension;
pub mod loader;
pub mod logging;
pub mod registry;
pub mod resolver;
pub mod storage;

pub use cache::{
    AssetCache, AssetFetchError, AssetFetcher, AssetHandle, AssetResult, CacheStats,
    FetchFailure, FetchOptions,
};
pub use config::{
    AssetCacheConfig, ConfigError, LoaderConfig, RegistryConfig, RemovalPolicy, ShellConfig,
};
pub use events::{EventBus, EventKind, ShellEvent};
pub use extension::descriptor::{ExtensionDescriptor, LoadState, RegistryEntry};
pub use extension::manifest::{
    parse_manifest, validate_manifest, ManifestEntry, ManifestError, ManifestValidationError,
};
pub use extension::version::{PreRelease, Version};
pub use loader::{LoadError, LoadOutcome, LoadResult, Loader, ModuleFetcher};
pub use logging::{default_log_level, init_logging, logging_status, LogDirective};
pub use registry::{Registry, RegistryError, RegistryResult, SyncReport};
pub use resolver::{resolve_order, DescriptorLookup, ResolveError};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore, StorageError, StorageResult};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
