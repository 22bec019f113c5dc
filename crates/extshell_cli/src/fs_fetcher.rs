//! Filesystem-backed module fetch backend.

use async_trait::async_trait;
use extshell_core::{ExtensionDescriptor, ModuleFetcher};
use log::debug;
use std::path::{Path, PathBuf};

/// Treats a unit as loadable when its `path` exists under `root`.
pub struct FsModuleFetcher {
    root: PathBuf,
}

impl FsModuleFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Builds a fetcher rooted at the directory containing `manifest`.
    pub fn beside(manifest: &Path) -> Self {
        let root = manifest
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::new(root)
    }
}

#[async_trait]
impl ModuleFetcher for FsModuleFetcher {
    async fn fetch_module(&self, descriptor: &ExtensionDescriptor) -> Result<(), String> {
        let target = self.root.join(&descriptor.path);
        let metadata = tokio::fs::metadata(&target)
            .await
            .map_err(|err| format!("{}: {err}", target.display()))?;
        if !metadata.is_file() {
            return Err(format!("{} is not a file", target.display()));
        }
        debug!(
            "event=fs_fetch module=cli status=ok tag={} path={}",
            descriptor.tag,
            target.display()
        );
        Ok(())
    }
}
