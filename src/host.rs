//! The platform boundary for loading compiled bundles.
//!
//! This crate never touches binary loading itself. A [`ModuleHost`] adapter
//! owns that: it opens bundle directories and artifacts as namespace
//! resolution stages, discovers the extension entry point a bundle exports,
//! and constructs it. On most platforms an adapter loads one fresh dynamic
//! library per load generation — that is the substitution for in-process
//! type redefinition, and it means type identity is only as isolated as the
//! platform's dynamic loader makes it. Namespace-level isolation is
//! guaranteed by this crate; identity-level isolation is the adapter's
//! problem and should be validated against the platform's loader semantics.

use std::fs;
use std::sync::Arc;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::namespace::{Namespace, Resolver};

/// Bundle-format generation this build understands.
pub const BUNDLE_GENERATION: u32 = 1;

/// File name of the bundle manifest inside a compiled output directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// The interchange record between compiler adapters and host adapters: the
/// compiler writes it next to the binaries, discovery reads it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleManifest {
    /// Generation of the toolchain that produced the bundle.
    pub generation: u32,
    /// Type names implementing the extension point, normally exactly one.
    pub entries: Vec<String>,
}

impl BundleManifest {
    pub fn new(entries: Vec<String>) -> Self {
        Self {
            generation: BUNDLE_GENERATION,
            entries,
        }
    }

    pub fn store(&self, dir: &Utf8Path) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(MANIFEST_FILE), text)?;
        Ok(())
    }

    /// Read a manifest and refuse generations newer than this build.
    pub fn load(dir: &Utf8Path) -> Result<Self, DiscoveryError> {
        let read = || -> anyhow::Result<Self> {
            let text = fs::read_to_string(dir.join(MANIFEST_FILE))?;
            Ok(serde_json::from_str(&text)?)
        };

        let manifest = read().map_err(DiscoveryError::Unreadable)?;
        if manifest.generation > BUNDLE_GENERATION {
            return Err(DiscoveryError::IncompatibleGeneration {
                found: manifest.generation,
                supported: BUNDLE_GENERATION,
            });
        }

        Ok(manifest)
    }
}

/// A candidate extension-point type found in a compiled bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub type_name: String,
}

/// The required extension point. Every loaded unit has exactly one live
/// instance of a type implementing this.
pub trait Extension {
    /// Self-reported version. Queried once per load, before any listener
    /// callback fires.
    fn version(&self) -> anyhow::Result<String>;

    fn on_load(&mut self) -> anyhow::Result<()>;

    fn on_unload(&mut self) -> anyhow::Result<()>;
}

/// External observer of unit state transitions.
pub trait StateListener {
    /// Invoked after construction and version query, before the unit counts
    /// as loaded. An error aborts the load.
    fn on_load(&self, unit: &str, version: &str) -> anyhow::Result<()>;

    /// Invoked as a unit begins unloading. Errors are captured through the
    /// unload error sink, never fatal.
    fn on_unload(&self, unit: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("couldn't read the bundle.\n{0}")]
    Unreadable(anyhow::Error),

    #[error("bundle generation {found} is newer than this host supports ({supported})")]
    IncompatibleGeneration { found: u32, supported: u32 },
}

#[derive(Debug, Error)]
pub enum InstantiateError {
    /// Construction failed in a way that points at out-of-date binaries.
    #[error("binaries are likely stale.\n{0}")]
    StaleBinaries(anyhow::Error),

    /// Construction failed resolving something a dependency should provide.
    #[error("a dependency is likely missing.\n{0}")]
    MissingDependency(anyhow::Error),

    #[error(transparent)]
    Other(anyhow::Error),
}

/// Platform adapter that wires compiled bundles into live objects.
pub trait ModuleHost {
    /// A resolution stage over a compiled bundle directory. Types resolved
    /// here are defined fresh for this namespace, never reused from a prior
    /// load generation.
    fn open_dir(&self, dir: &Utf8Path) -> anyhow::Result<Box<dyn Resolver>>;

    /// A resolution stage over a standalone bundle artifact.
    fn open_artifact(&self, path: &Utf8Path) -> anyhow::Result<Box<dyn Resolver>>;

    /// All extension-point candidates in a compiled bundle.
    fn entry_points(&self, dir: &Utf8Path) -> Result<Vec<EntryPoint>, DiscoveryError>;

    /// Construct the entry point through its no-argument constructor,
    /// resolving types through `namespace`.
    fn instantiate(
        &self,
        entry: &EntryPoint,
        namespace: &Arc<Namespace>,
    ) -> Result<Box<dyn Extension>, InstantiateError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();

        let manifest = BundleManifest::new(vec!["com.example.Main".into()]);
        manifest.store(dir).unwrap();

        let loaded = BundleManifest::load(dir).unwrap();
        assert_eq!(loaded.generation, BUNDLE_GENERATION);
        assert_eq!(loaded.entries, vec!["com.example.Main".to_owned()]);
    }

    #[test]
    fn newer_generation_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();

        let manifest = BundleManifest {
            generation: BUNDLE_GENERATION + 1,
            entries: vec!["Main".into()],
        };
        manifest.store(dir).unwrap();

        let err = BundleManifest::load(dir).unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::IncompatibleGeneration { found, .. } if found == BUNDLE_GENERATION + 1
        ));
    }

    #[test]
    fn missing_manifest_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();

        assert!(matches!(
            BundleManifest::load(dir),
            Err(DiscoveryError::Unreadable(_))
        ));
    }
}
