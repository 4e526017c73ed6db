//! Plugin registry: one live instance per module name, in load order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::plugin::module::{Module, capabilities};
use crate::plugin::provider::{ModuleProvider, ModuleRequest};

/// Structural errors of a `load` or `unload` call.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No module of that name exists (file missing, or not loaded on unload).
    #[error("module '{0}' not found")]
    NotFound(String),

    /// The dynamic loader rejected the library.
    #[error("failed to load module '{name}': {reason}")]
    Load { name: String, reason: String },

    /// Factory or destructor symbol missing.
    #[error("module '{name}' does not export the required symbols: {reason}")]
    Symbol { name: String, reason: String },

    /// The factory returned no instance.
    #[error("module '{0}' factory returned no instance")]
    Init(String),
}

struct RegistryState {
    directory: PathBuf,
    order: Vec<String>,
    modules: HashMap<String, Arc<dyn Module>>,
}

/// Resolves module names to live instances.
///
/// One lock guards mutation and listing. Fan-out callers copy the name list
/// with [`list_loaded`](Self::list_loaded) and resolve each instance with
/// [`lookup`](Self::lookup), so no lock is held while a module runs.
pub struct PluginRegistry {
    provider: Arc<dyn ModuleProvider>,
    state: Mutex<RegistryState>,
}

impl PluginRegistry {
    pub fn new(provider: Arc<dyn ModuleProvider>) -> Self {
        Self {
            provider,
            state: Mutex::new(RegistryState {
                directory: PathBuf::from("."),
                order: Vec::new(),
                modules: HashMap::new(),
            }),
        }
    }

    /// Base directory module `N` is resolved under (`<dir>/N/N.<ext>`).
    pub fn set_directory(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        tracing::debug!(dir = %path.display(), "Plugin directory set");
        self.state.lock().directory = path;
    }

    pub fn directory(&self) -> PathBuf {
        self.state.lock().directory.clone()
    }

    /// Load `name`. Succeeds without side effects if it is already loaded.
    pub fn load(&self, name: &str, expose_global_symbols: bool) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        if state.modules.contains_key(name) {
            tracing::debug!(plugin = %name, "Module already loaded");
            return Ok(());
        }

        let request = ModuleRequest {
            name,
            directory: &state.directory,
            expose_global_symbols,
        };
        let module = self.provider.instantiate(&request).inspect_err(|e| {
            tracing::warn!(plugin = %name, error = %e, "Module load failed");
        })?;

        let caps = capabilities(module.as_ref());
        tracing::info!(plugin = %name, capabilities = ?caps, "Module loaded");

        state.order.push(name.to_string());
        state.modules.insert(name.to_string(), module);
        Ok(())
    }

    /// Unload `name`. The instance is destroyed once the last in-flight
    /// reference to it is released.
    pub fn unload(&self, name: &str) -> Result<(), RegistryError> {
        let module = {
            let mut state = self.state.lock();
            let module = state
                .modules
                .remove(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            state.order.retain(|n| n != name);
            module
        };
        drop(module);
        tracing::info!(plugin = %name, "Module unloaded");
        Ok(())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.state.lock().modules.contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.state.lock().modules.get(name).cloned()
    }

    /// Loaded names in load order.
    pub fn list_loaded(&self) -> Vec<String> {
        self.state.lock().order.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("loaded", &self.list_loaded())
            .finish_non_exhaustive()
    }
}
