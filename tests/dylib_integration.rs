//! Dynamic Library Integration Tests for telemetryd
//!
//! Builds the `echo-module` fixture as a shared object, installs it in a
//! plugin directory and drives it through the registry.

#![cfg(unix)]

use std::env::consts::{DLL_EXTENSION, DLL_PREFIX};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock};

use telemetryd::plugin::{Capability, DylibProvider, PluginRegistry, capabilities};
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

/// Build the fixture once per test binary and return the produced library.
fn echo_library() -> &'static Path {
    static LIBRARY: OnceLock<PathBuf> = OnceLock::new();
    LIBRARY.get_or_init(|| {
        let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
        let target_dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join("echo-module");
        let status = Command::new(env!("CARGO"))
            .arg("build")
            .arg("--manifest-path")
            .arg(&manifest)
            .args(["-p", "echo-module"])
            .arg("--target-dir")
            .arg(&target_dir)
            .status()
            .unwrap();
        assert!(status.success(), "building echo-module failed");

        target_dir
            .join("debug")
            .join(format!("{DLL_PREFIX}echo_module.{DLL_EXTENSION}"))
    })
}

/// Copy the fixture into `<dir>/<name>/<name>.<ext>`.
fn install(dir: &Path, name: &str) {
    let path = DylibProvider::library_path(dir, name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::copy(echo_library(), &path).unwrap();
}

fn registry(dir: &Path) -> PluginRegistry {
    let registry = PluginRegistry::new(Arc::new(DylibProvider));
    registry.set_directory(dir);
    registry
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_declared_module_loads_and_runs() {
    let dir = TempDir::new().unwrap();
    install(dir.path(), "echo");
    let registry = registry(dir.path());

    registry.load("echo", false).unwrap();
    assert!(registry.is_loaded("echo"));

    let module = registry.lookup("echo").unwrap();
    assert_eq!(
        capabilities(module.as_ref()),
        [Capability::Config, Capability::Init]
    );

    let marker = dir.path().join("destroyed");
    let config = module.as_config().unwrap();
    config.config("Marker", marker.to_str().unwrap()).unwrap();
    assert!(config.config("Bogus", "1").is_err());
    module.as_init().unwrap().init().unwrap();

    drop(module);
    registry.unload("echo").unwrap();
    assert!(!registry.is_loaded("echo"));

    // Written by the library's destructor before the library was closed.
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "1");
}

#[test]
fn test_reference_outlives_unload() {
    let dir = TempDir::new().unwrap();
    install(dir.path(), "echo");
    let registry = registry(dir.path());

    registry.load("echo", true).unwrap();
    let module = registry.lookup("echo").unwrap();
    let marker = dir.path().join("destroyed");
    module
        .as_config()
        .unwrap()
        .config("Marker", marker.to_str().unwrap())
        .unwrap();

    registry.unload("echo").unwrap();
    assert!(!marker.exists());

    // The in-flight reference still reaches live code.
    module.as_init().unwrap().init().unwrap();
    drop(module);
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "1");
}

#[test]
fn test_same_library_under_two_names() {
    let dir = TempDir::new().unwrap();
    install(dir.path(), "first");
    install(dir.path(), "second");
    let registry = registry(dir.path());

    registry.load("first", false).unwrap();
    registry.load("second", false).unwrap();
    assert_eq!(registry.list_loaded(), ["first", "second"]);

    registry.unload("first").unwrap();
    let second = registry.lookup("second").unwrap();
    second.as_init().unwrap().init().unwrap();
}
