//! Minimal shared-library module.
//!
//! `Marker` names a file that is written when the instance is destroyed, so
//! the host can tell the library's destructor ran.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use telemetryd::plugin::{Configure, Init, Module, ModuleError, ModuleResult};

#[derive(Default)]
pub struct Echo {
    marker: Mutex<Option<PathBuf>>,
    inits: AtomicUsize,
}

impl Configure for Echo {
    fn config(&self, key: &str, value: &str) -> ModuleResult {
        match key {
            "Marker" => {
                *self.marker.lock() = Some(PathBuf::from(value));
                Ok(())
            }
            _ => Err(ModuleError::InvalidOption {
                key: key.to_string(),
                reason: "unknown option".to_string(),
            }),
        }
    }
}

impl Init for Echo {
    fn init(&self) -> ModuleResult {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Module for Echo {
    fn as_config(&self) -> Option<&dyn Configure> {
        Some(self)
    }

    fn as_init(&self) -> Option<&dyn Init> {
        Some(self)
    }
}

impl Drop for Echo {
    fn drop(&mut self) {
        if let Some(path) = self.marker.get_mut().take() {
            let inits = self.inits.load(Ordering::SeqCst);
            let _ = std::fs::write(path, inits.to_string());
        }
    }
}

telemetryd::declare_module!(Echo::default());
