#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod compiler;
mod descriptor;
mod error;
mod graph;
mod host;
#[cfg(feature = "logging")]
pub mod logging;
mod namespace;
mod registry;
#[cfg(test)]
mod testing;
mod unit;
mod util;

pub use crate::compiler::{Coalescer, CommandCompiler, CompileJob, Compiler, Diagnostic};
pub use crate::descriptor::{
    DESCRIPTOR_FILE, Dependency, DependencyScope, Descriptor, resolved_path,
};
pub use crate::error::{
    CompileError, CompilerFailure, ConfigError, LoadError, OrderingViolation, RegistryError,
    StructuralError, UnitError, UnitErrorKind, UnloadError,
};
pub use crate::graph::{DependencyGraph, Walk};
pub use crate::host::{
    BUNDLE_GENERATION, BundleManifest, DiscoveryError, EntryPoint, Extension, InstantiateError,
    MANIFEST_FILE, ModuleHost, StateListener,
};
pub use crate::namespace::{Namespace, Resolution, Resolver, TypeRef};
pub use crate::registry::{
    DependentsPolicy, LoadReport, RecompileReport, Registry, RegistryConfig, SyncReport,
    UnloadMode, UnloadReport,
};
pub use crate::unit::{BINARY_DIR, DISABLED_MARKER, STAGING_DIR, Unit};
