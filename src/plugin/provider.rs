//! Module providers: how a module name becomes a live instance.
//!
//! - [`DylibProvider`]: shared objects at `<dir>/<name>/<name>.<ext>`
//! - [`StaticProvider`]: in-process factories (built-in modules, tests)
//! - [`ChainProvider`]: first provider that knows the name wins
//!
//! Destruction is tied to the returned `Arc`: the instance is torn down when
//! the last reference is dropped.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use libloading::Library;

use crate::plugin::module::{
    Collect, Configure, Flush, Init, Module, Notify, Shutdown, Store,
};
use crate::plugin::registry::RegistryError;

/// Exported factory symbol: `extern "C" fn() -> *mut ModuleBox`.
pub const CREATE_SYMBOL: &str = "telemetryd_create_module";
/// Exported destructor symbol: `unsafe extern "C" fn(*mut ModuleBox)`.
pub const DESTROY_SYMBOL: &str = "telemetryd_destroy_module";

/// Opaque instance handed across the library boundary.
pub type ModuleBox = Box<dyn Module>;

type CreateFn = extern "C" fn() -> *mut ModuleBox;
type DestroyFn = unsafe extern "C" fn(*mut ModuleBox);

/// Parameters of one instantiation.
#[derive(Debug, Clone)]
pub struct ModuleRequest<'a> {
    pub name: &'a str,
    pub directory: &'a Path,
    /// Make the library's symbols visible to libraries loaded after it.
    pub expose_global_symbols: bool,
}

/// Turns a module name into a live instance.
pub trait ModuleProvider: Send + Sync {
    fn instantiate(&self, request: &ModuleRequest<'_>) -> Result<Arc<dyn Module>, RegistryError>;
}

// =============================================================================
// Dynamic libraries
// =============================================================================

/// Loads modules from shared objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibProvider;

impl DylibProvider {
    /// Path of module `name` under `directory`.
    pub fn library_path(directory: &Path, name: &str) -> PathBuf {
        directory
            .join(name)
            .join(format!("{name}.{}", std::env::consts::DLL_EXTENSION))
    }

    fn open(path: &Path, expose_global_symbols: bool) -> Result<Library, libloading::Error> {
        #[cfg(unix)]
        {
            use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_LOCAL, RTLD_NOW};
            let scope = if expose_global_symbols {
                RTLD_GLOBAL
            } else {
                RTLD_LOCAL
            };
            // SAFETY: running a module's initializers is the point of loading it.
            unsafe { UnixLibrary::open(Some(path), RTLD_NOW | scope) }.map(Library::from)
        }
        #[cfg(not(unix))]
        {
            let _ = expose_global_symbols;
            // SAFETY: as above.
            unsafe { Library::new(path) }
        }
    }
}

impl ModuleProvider for DylibProvider {
    fn instantiate(&self, request: &ModuleRequest<'_>) -> Result<Arc<dyn Module>, RegistryError> {
        let name = request.name;
        let path = Self::library_path(request.directory, name);
        if !path.is_file() {
            tracing::warn!(plugin = %name, path = %path.display(), "Module library not found");
            return Err(RegistryError::NotFound(name.to_string()));
        }

        let library =
            Self::open(&path, request.expose_global_symbols).map_err(|e| RegistryError::Load {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        // SAFETY: the symbol types are fixed by `declare_module!`.
        let (create, destroy) = unsafe {
            let create = library.get::<CreateFn>(CREATE_SYMBOL.as_bytes());
            let destroy = library.get::<DestroyFn>(DESTROY_SYMBOL.as_bytes());
            match (create, destroy) {
                (Ok(create), Ok(destroy)) => (*create, *destroy),
                (Err(e), _) | (_, Err(e)) => {
                    return Err(RegistryError::Symbol {
                        name: name.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        };

        let instance =
            NonNull::new(create()).ok_or_else(|| RegistryError::Init(name.to_string()))?;

        tracing::debug!(plugin = %name, path = %path.display(), "Module library opened");
        Ok(Arc::new(DylibModule {
            instance,
            destroy,
            _library: library,
        }))
    }
}

/// An instance owned by a loaded library. Field order matters: the instance is
/// destroyed in `drop`, then the library is closed.
struct DylibModule {
    instance: NonNull<ModuleBox>,
    destroy: DestroyFn,
    _library: Library,
}

// SAFETY: the pointee is a `Box<dyn Module>` and `Module: Send + Sync`.
unsafe impl Send for DylibModule {}
unsafe impl Sync for DylibModule {}

impl DylibModule {
    fn inner(&self) -> &dyn Module {
        // SAFETY: `instance` stays valid until `drop`.
        unsafe { self.instance.as_ref().as_ref() }
    }
}

impl Drop for DylibModule {
    fn drop(&mut self) {
        // SAFETY: produced by the library's factory, destroyed exactly once.
        unsafe { (self.destroy)(self.instance.as_ptr()) }
    }
}

impl Module for DylibModule {
    fn as_config(&self) -> Option<&dyn Configure> {
        self.inner().as_config()
    }

    fn as_init(&self) -> Option<&dyn Init> {
        self.inner().as_init()
    }

    fn as_collect(&self) -> Option<&dyn Collect> {
        self.inner().as_collect()
    }

    fn as_store(&self) -> Option<&dyn Store> {
        self.inner().as_store()
    }

    fn as_flush(&self) -> Option<&dyn Flush> {
        self.inner().as_flush()
    }

    fn as_shutdown(&self) -> Option<&dyn Shutdown> {
        self.inner().as_shutdown()
    }

    fn as_notify(&self) -> Option<&dyn Notify> {
        self.inner().as_notify()
    }
}

/// Export the factory and destructor symbols for a module library.
///
/// ```rust,ignore
/// telemetryd::declare_module!(MyModule::default());
/// ```
#[macro_export]
macro_rules! declare_module {
    ($ctor:expr) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn telemetryd_create_module() -> *mut $crate::plugin::ModuleBox {
            let module: $crate::plugin::ModuleBox = ::std::boxed::Box::new($ctor);
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(module))
        }

        /// # Safety
        /// `ptr` must come from `telemetryd_create_module` and not be used afterwards.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn telemetryd_destroy_module(ptr: *mut $crate::plugin::ModuleBox) {
            if !ptr.is_null() {
                drop(unsafe { ::std::boxed::Box::from_raw(ptr) });
            }
        }
    };
}

// =============================================================================
// In-process factories
// =============================================================================

type Factory = Box<dyn Fn() -> Option<Arc<dyn Module>> + Send + Sync>;

/// Provider backed by in-process factories. A factory returning `None` is
/// reported as an init error.
#[derive(Default)]
pub struct StaticProvider {
    factories: HashMap<String, Factory>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Option<Arc<dyn Module>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Option<Arc<dyn Module>> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for StaticProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticProvider")
            .field("factories", &self.factories.len())
            .finish()
    }
}

impl ModuleProvider for StaticProvider {
    fn instantiate(&self, request: &ModuleRequest<'_>) -> Result<Arc<dyn Module>, RegistryError> {
        let factory = self
            .factories
            .get(request.name)
            .ok_or_else(|| RegistryError::NotFound(request.name.to_string()))?;
        factory().ok_or_else(|| RegistryError::Init(request.name.to_string()))
    }
}

/// Tries each provider in order. `NotFound` falls through; any other error is final.
#[derive(Default)]
pub struct ChainProvider {
    providers: Vec<Arc<dyn ModuleProvider>>,
}

impl ChainProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn ModuleProvider>) -> Self {
        self.providers.push(provider);
        self
    }
}

impl ModuleProvider for ChainProvider {
    fn instantiate(&self, request: &ModuleRequest<'_>) -> Result<Arc<dyn Module>, RegistryError> {
        for provider in &self.providers {
            match provider.instantiate(request) {
                Err(RegistryError::NotFound(_)) => continue,
                other => return other,
            }
        }
        Err(RegistryError::NotFound(request.name.to_string()))
    }
}
