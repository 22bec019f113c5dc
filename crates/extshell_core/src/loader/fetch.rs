//! Module fetch capability.

use crate::extension::descriptor::ExtensionDescriptor;
use async_trait::async_trait;

/// Brings one unit online (dynamic import, plugin load, static table, ...).
///
/// On `Ok(())` the unit's side effects are complete. On `Err` nothing may be
/// left partially registered; the message becomes the unit's `last_error`.
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    async fn fetch_module(&self, descriptor: &ExtensionDescriptor) -> Result<(), String>;
}
