//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Once;

use blood_covmap::host::Linkage;
use blood_covmap::ir::Module;

static TRACING: Once = Once::new();

/// Install a `RUST_LOG`-filtered subscriber once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A module with one instrumented function per `(name, linkage)`, one
/// counter each.
pub fn instrumented_module(functions: &[(&str, Linkage)]) -> Module {
    let mut module = Module::new("test_module");
    for &(name, linkage) in functions {
        module.add_function(name, linkage);
        module.instrument_function(name, 1).unwrap();
    }
    module
}
