//! Plugin layer
//!
//! Dynamic modules, the registry that owns them, and the service that fans
//! lifecycle events out to them:
//!
//! - [`Module`] and its capability traits
//! - [`ModuleProvider`]: [`DylibProvider`], [`StaticProvider`], [`ChainProvider`]
//! - [`PluginRegistry`]: one live instance per name, in load order
//! - [`PluginService`]: init / read / write / flush / notify / shutdown fan-out

mod module;
mod provider;
mod registry;
mod service;

pub use module::{
    Capability, Collect, Configure, Flush, Init, Module, ModuleError, ModuleResult, Notify,
    ReadContext, Shutdown, Store, capabilities,
};
pub use provider::{
    CREATE_SYMBOL, ChainProvider, DESTROY_SYMBOL, DylibProvider, ModuleBox, ModuleProvider,
    ModuleRequest, StaticProvider,
};
pub use registry::{PluginRegistry, RegistryError};
pub use service::{PluginService, ServiceError};
